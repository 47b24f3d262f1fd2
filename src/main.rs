use std::{net::SocketAddr, time::Duration};

use media_relay::{ApiError, AppState, Config, build_router, jar};
use tokio::net::TcpListener;
use tracing::{info, warn};

const STALE_JAR_SECONDS: u64 = 24 * 60 * 60;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_relay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env()?;

    tokio::fs::create_dir_all(&config.cookie_jar_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "No se pudo crear la carpeta temporal de cookies: {error}"
            ))
        })?;

    let removed = jar::sweep_stale(
        &config.cookie_jar_dir,
        Duration::from_secs(STALE_JAR_SECONDS),
    )
    .await;
    if removed > 0 {
        info!("Eliminados {removed} archivo(s) de cookies huerfanos.");
    }

    if let Err(error) = config.tool.resolve().await {
        warn!("{error}. Las descargas fallaran hasta que se instale.");
    }
    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: se usara la IP del socket para limitar descargas.");
    }
    info!("Fuente de cookies: {}", config.credentials.describe());

    let addr = config.bind_addr.clone();
    let app = build_router(AppState::new(config))?;

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("No se pudo iniciar el puerto {addr}: {error}"))
    })?;

    info!("Servidor listo en http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")))
}
