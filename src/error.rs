use std::path::PathBuf;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{0}")]
    Validation(String),

    #[error("{name} no encontrado en el directorio {}", dir.display())]
    ToolNotFound { name: String, dir: PathBuf },

    #[error("Error al crear archivo de cookies: {0}")]
    CredentialWrite(#[source] std::io::Error),

    #[error("No se pudo iniciar la herramienta de descarga: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("La herramienta de descarga finalizo sin enviar datos")]
    NoData,

    #[error("La herramienta de descarga finalizo con {0}")]
    ToolFailed(String),

    #[error("La herramienta de descarga no envio datos durante {0} segundos")]
    IdleTimeout(u64),
}

impl DownloadError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::CredentialWrite(_) => "CREDENTIAL_WRITE_ERROR",
            Self::Spawn(_) => "SPAWN_ERROR",
            Self::NoData => "NO_DATA",
            Self::ToolFailed(_) => "TOOL_FAILED",
            Self::IdleTimeout(_) => "TOOL_IDLE_TIMEOUT",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn rate_limited(limit: usize, retry_after_seconds: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: format!("Has superado el limite de {limit} descargas por minuto."),
            code: Some("RATE_LIMITED"),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        let code = Some(error.code());
        match error {
            DownloadError::Validation(message) => Self {
                code,
                ..Self::bad_request(message)
            },
            // Processing failures share one client-facing message; details stay in the logs.
            DownloadError::NoData
            | DownloadError::ToolFailed(_)
            | DownloadError::IdleTimeout(_) => Self {
                code,
                ..Self::internal("Error al procesar la descarga.")
            },
            other => Self {
                code,
                ..Self::internal(other.to_string())
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}
