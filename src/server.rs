use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Query, Request, State, rejection::QueryRejection},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    args::{build_arguments, is_audio_alias},
    bridge,
    config::{Config, non_empty},
    cookies,
    error::{ApiError, DownloadError},
    jar::CookieJar,
    rate_limit::{RateLimiter, client_ip},
};

const DEFAULT_EXTENSION: &str = "mp4";
const MAX_EXTENSION_LEN: usize = 8;

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    download_semaphore: Arc<Semaphore>,
    rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    url: Option<String>,
    format: Option<String>,
}

/// A validated `/download` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub format: Option<String>,
}

impl DownloadRequest {
    pub fn from_query(query: DownloadQuery) -> Result<Self, DownloadError> {
        let url = query
            .url
            .as_deref()
            .and_then(non_empty)
            .ok_or_else(|| DownloadError::Validation("URL del video no proporcionada.".to_string()))?;

        // Anything else is handed to the tool as-is: ids, `ytsearch:` queries.
        if url.starts_with('-') {
            return Err(DownloadError::Validation(
                "URL invalida: no puede empezar con '-'.".to_string(),
            ));
        }

        Ok(Self {
            url: url.to_string(),
            format: query
                .format
                .as_deref()
                .and_then(non_empty)
                .map(ToString::to_string),
        })
    }

    pub fn is_audio(&self) -> bool {
        is_audio_alias(self.format.as_deref())
    }

    pub fn content_type(&self) -> &'static str {
        if self.is_audio() { "audio/mpeg" } else { "video/mp4" }
    }

    /// `video.<format>` for short alphanumeric formats, `video.mp4` otherwise.
    pub fn attachment_filename(&self) -> String {
        let extension = self
            .format
            .as_deref()
            .filter(|format| {
                format.len() <= MAX_EXTENSION_LEN
                    && format.chars().all(|character| character.is_ascii_alphanumeric())
            })
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        format!("video.{extension}")
    }
}

pub fn build_router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.config.allowed_origins)?;

    let download_routes = Router::new()
        .route("/download", get(download))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ));

    let mut app = Router::new()
        .route("/health", get(health))
        .merge(download_routes);

    if let Some(static_dir) = &state.config.static_dir {
        info!("Sirviendo archivos estaticos desde {:?}", static_dir);
        app = app
            .route_service("/", ServeFile::new(static_dir.join("index.html")))
            .nest_service("/static", ServeDir::new(static_dir));
    }

    Ok(app
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), addr, state.config.trust_proxy_headers);

    if let Err(error) = state.rate_limiter.register(&ip).await {
        warn!("Limite de descargas alcanzado para IP {ip}");
        return Err(error);
    }

    Ok(next.run(request).await)
}

async fn download(
    State(state): State<AppState>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let request = DownloadRequest::from_query(query)?;

    let span = info_span!("download", id = %Uuid::new_v4());
    stream_download(state, request)
        .instrument(span)
        .await
        .inspect_err(|error| warn!("Descarga fallida: {}", error.message))
}

async fn stream_download(state: AppState, request: DownloadRequest) -> Result<Response, ApiError> {
    info!(
        "Descarga solicitada url={:?} format={:?}",
        request.url, request.format
    );

    let program = state.config.tool.resolve().await?;

    let permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("No se pudo reservar capacidad de descarga."))?;

    let jar = match state.config.credentials.fetch().await {
        Some(credential) => Some(cookies::materialize(&state.config.cookie_jar_dir, &credential).await?),
        None => {
            if state.config.credentials.is_enabled() {
                debug!("La fuente de cookies no devolvio datos; se continua sin cookies.");
            }
            None
        }
    };

    let args = build_arguments(
        &request.url,
        request.format.as_deref(),
        jar.as_ref().map(CookieJar::path),
    );
    let mut bridge = bridge::spawn(&program, &args, jar, Some(permit), state.config.bridge).await?;

    // Headers are committed only once the tool has produced its first byte.
    let first = bridge.first_chunk().await?;
    let headers = download_headers(&request)?;
    let body = Body::from_stream(bridge.into_body_stream(first));

    Ok((StatusCode::OK, headers, body).into_response())
}

fn download_headers(request: &DownloadRequest) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(request.content_type()));

    let content_disposition = format!("attachment; filename=\"{}\"", request.attachment_filename());
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition)
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );

    Ok(headers)
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() || configured.iter().any(|origin| origin == "*") {
        debug!("CORS abierto a cualquier origen.");
        return Ok(layer.allow_origin(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Origen invalido en ALLOWED_ORIGINS: {origin}. Usa valores tipo https://dominio.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    info!(
        "CORS allow-list cargada con {} origen(es): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    Ok(layer.allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        origin
            .to_str()
            .ok()
            .and_then(normalize_origin)
            .is_some_and(|value| allowed_origins.contains(&value))
    })))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
