use std::{path::PathBuf, time::Duration};

use tracing::warn;
use url::Url;

use crate::{
    bridge::BridgeSettings,
    cookies::{CredentialSource, cookie_domain_for},
    error::ApiError,
    tool::ToolLocator,
};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8888";
const DEFAULT_TOOL_NAME: &str = "yt-dlp";
const DEFAULT_COOKIE_DOMAIN: &str = ".youtube.com";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_RATE_LIMIT_PER_MINUTE: usize = 100;
const COOKIE_HARVEST_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub tool: ToolLocator,
    pub cookie_jar_dir: PathBuf,
    pub credentials: CredentialSource,
    pub max_concurrent_downloads: usize,
    pub bridge: BridgeSettings,
    pub rate_limit_per_minute: usize,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
    pub static_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ApiError> {
        let cwd = std::env::current_dir().map_err(|error| {
            ApiError::internal(format!("No se pudo leer el directorio actual: {error}"))
        })?;

        let bin_dir = read_string_env("TOOL_BIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.join("bin"));
        let tool_name = read_string_env("TOOL_NAME").unwrap_or_else(|| DEFAULT_TOOL_NAME.to_string());
        let cookie_jar_dir = read_string_env("COOKIE_JAR_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let static_dir = read_string_env("STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.join("public"));

        Ok(Self {
            bind_addr: resolve_bind_addr(),
            tool: ToolLocator::new(bin_dir, &tool_name),
            cookie_jar_dir,
            credentials: credential_source_from_env()?,
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            bridge: bridge_settings(
                read_usize_env("STREAM_CHUNK_BYTES"),
                read_usize_env("STREAM_BUFFER_CHUNKS"),
                read_usize_env("TOOL_IDLE_TIMEOUT_SECONDS"),
            ),
            rate_limit_per_minute: read_usize_env("RATE_LIMIT_PER_MINUTE")
                .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE),
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            allowed_origins: read_list_env("ALLOWED_ORIGINS"),
            static_dir: static_dir.is_dir().then_some(static_dir),
        })
    }

    /// Defaults suitable for tests and embedding: no credentials, no static UI.
    pub fn with_tool(bin_dir: impl Into<PathBuf>, cookie_jar_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            tool: ToolLocator::new(bin_dir, DEFAULT_TOOL_NAME),
            cookie_jar_dir: cookie_jar_dir.into(),
            credentials: CredentialSource::Disabled,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            bridge: BridgeSettings::default(),
            rate_limit_per_minute: 0,
            trust_proxy_headers: false,
            allowed_origins: Vec::new(),
            static_dir: None,
        }
    }
}

/// Unset or zero values keep the [`BridgeSettings`] defaults.
fn bridge_settings(
    chunk_bytes: Option<usize>,
    buffer_chunks: Option<usize>,
    idle_timeout_seconds: Option<usize>,
) -> BridgeSettings {
    let defaults = BridgeSettings::default();
    BridgeSettings {
        chunk_bytes: chunk_bytes
            .filter(|value| *value > 0)
            .unwrap_or(defaults.chunk_bytes),
        buffer_chunks: buffer_chunks
            .filter(|value| *value > 0)
            .unwrap_or(defaults.buffer_chunks),
        idle_timeout: idle_timeout_seconds
            .filter(|value| *value > 0)
            .map(|value| Duration::from_secs(value as u64))
            .unwrap_or(defaults.idle_timeout),
    }
}

/// `YOUTUBE_COOKIES` wins over `YOUTUBE_COOKIES_FILE`, which wins over
/// `COOKIE_SOURCE_URL`.
fn credential_source_from_env() -> Result<CredentialSource, ApiError> {
    let domain =
        read_string_env("COOKIE_DOMAIN").unwrap_or_else(|| DEFAULT_COOKIE_DOMAIN.to_string());

    if let Some(value) = read_string_env("YOUTUBE_COOKIES") {
        return Ok(CredentialSource::Static { value, domain });
    }

    if let Some(path) = read_string_env("YOUTUBE_COOKIES_FILE") {
        return Ok(CredentialSource::File {
            path: PathBuf::from(path),
            domain,
        });
    }

    if let Some(raw_url) = read_string_env("COOKIE_SOURCE_URL") {
        let url = Url::parse(&raw_url).map_err(|error| {
            ApiError::internal(format!("COOKIE_SOURCE_URL invalida ({raw_url}): {error}"))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(COOKIE_HARVEST_TIMEOUT_SECONDS))
            .build()
            .map_err(|error| ApiError::internal(format!("No se pudo crear cliente HTTP: {error}")))?;
        let domain = if std::env::var("COOKIE_DOMAIN").is_ok() {
            domain
        } else {
            cookie_domain_for(&url).unwrap_or(domain)
        };
        return Ok(CredentialSource::Harvest {
            client,
            url,
            domain,
        });
    }

    warn!("YOUTUBE_COOKIES no esta definida. Sin cookies, el acceso puede ser bloqueado.");
    Ok(CredentialSource::Disabled)
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_bool_env(name: &str) -> Option<bool> {
    std::env::var(name).ok().as_deref().and_then(parse_bool)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_list_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|value| parse_list(&value))
        .unwrap_or_default()
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}
