use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{SET_COOKIE, USER_AGENT};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    args,
    error::DownloadError,
    jar::{CookieJar, JAR_PREFIX, JAR_SUFFIX},
};

pub const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File";

const COOKIE_ATTRIBUTES: [&str; 9] = [
    "domain",
    "path",
    "expires",
    "max-age",
    "secure",
    "httponly",
    "samesite",
    "priority",
    "partitioned",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub raw: String,
    pub default_domain: String,
}

#[derive(Debug, Clone)]
pub enum CredentialSource {
    Disabled,
    Static {
        value: String,
        domain: String,
    },
    File {
        path: PathBuf,
        domain: String,
    },
    Harvest {
        client: reqwest::Client,
        url: Url,
        domain: String,
    },
}

impl CredentialSource {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Disabled => "deshabilitado".to_string(),
            Self::Static { .. } => "variable de entorno".to_string(),
            Self::File { path, .. } => format!("archivo {:?}", path),
            Self::Harvest { url, .. } => format!("cabeceras set-cookie de {url}"),
        }
    }

    /// Failures are logged and yield `None`.
    pub async fn fetch(&self) -> Option<Credential> {
        match self {
            Self::Disabled => None,
            Self::Static { value, domain } => non_empty_credential(value.clone(), domain),
            Self::File { path, domain } => match tokio::fs::read_to_string(path).await {
                Ok(contents) => non_empty_credential(contents, domain),
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    warn!("Archivo de cookies configurado {:?} no existe.", path);
                    None
                }
                Err(error) => {
                    warn!("No se pudo leer el archivo de cookies {:?}: {error}", path);
                    None
                }
            },
            Self::Harvest {
                client,
                url,
                domain,
            } => match harvest_set_cookies(client, url).await {
                Ok(values) => {
                    debug!("Se capturaron {} cookies de {url}", values.len());
                    non_empty_credential(values.join("\n"), domain)
                }
                Err(error) => {
                    warn!("Error al recolectar cookies de {url}: {error}");
                    None
                }
            },
        }
    }
}

fn non_empty_credential(raw: String, domain: &str) -> Option<Credential> {
    if raw.trim().is_empty() {
        None
    } else {
        Some(Credential {
            raw,
            default_domain: domain.to_string(),
        })
    }
}

pub async fn harvest_set_cookies(
    client: &reqwest::Client,
    url: &Url,
) -> Result<Vec<String>, reqwest::Error> {
    let response = client
        .get(url.clone())
        .header(USER_AGENT, args::USER_AGENT)
        .send()
        .await?;

    Ok(response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(ToString::to_string)
        .collect())
}

/// `https://www.youtube.com/` -> `.youtube.com`
pub fn cookie_domain_for(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    Some(format!(".{host}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CookieRecord {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    expires: Option<i64>,
    max_age: Option<i64>,
    secure: bool,
    http_only: bool,
}

impl CookieRecord {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: None,
            path: None,
            expires: None,
            max_age: None,
            secure: name.starts_with("__Secure-") || name.starts_with("__Host-"),
            http_only: false,
        }
    }

    fn apply_attribute(&mut self, key: &str, value: Option<&str>) {
        let value = value.map(str::trim).filter(|value| !value.is_empty());
        match key {
            "domain" => {
                self.domain = value.map(|domain| {
                    let domain = domain.to_ascii_lowercase();
                    if domain.starts_with('.') {
                        domain
                    } else {
                        format!(".{domain}")
                    }
                });
            }
            "path" => self.path = value.map(ToString::to_string),
            "expires" => self.expires = value.and_then(parse_cookie_date),
            "max-age" => self.max_age = value.and_then(|seconds| seconds.parse().ok()),
            "secure" => self.secure = true,
            "httponly" => self.http_only = true,
            _ => {}
        }
    }

    /// `None` when the cookie is already expired and must not be written.
    fn netscape_line(&self, default_domain: &str, now: i64) -> Option<String> {
        let expires = match self.max_age {
            Some(seconds) if seconds <= 0 => return None,
            Some(seconds) => now.saturating_add(seconds),
            None => self.expires.unwrap_or(0),
        };

        let domain = self.domain.as_deref().unwrap_or(default_domain);
        let include_subdomains = if domain.starts_with('.') { "TRUE" } else { "FALSE" };
        let domain_field = if self.http_only {
            format!("#HttpOnly_{domain}")
        } else {
            domain.to_string()
        };

        Some(format!(
            "{domain_field}\t{include_subdomains}\t{}\t{}\t{expires}\t{}\t{}",
            self.path.as_deref().unwrap_or("/"),
            if self.secure { "TRUE" } else { "FALSE" },
            self.name,
            self.value,
        ))
    }
}

fn parse_cookie_date(value: &str) -> Option<i64> {
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.timestamp());
    }

    ["%a, %d-%b-%Y %H:%M:%S GMT", "%a, %d-%b-%y %H:%M:%S GMT", "%a, %d %b %Y %H:%M:%S GMT"]
        .iter()
        .find_map(|pattern| NaiveDateTime::parse_from_str(value, pattern).ok())
        .map(|naive| naive.and_utc().timestamp())
}

fn is_netscape_jar(raw: &str) -> bool {
    raw.lines().map(str::trim).any(|line| {
        let entry = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        line.starts_with(NETSCAPE_HEADER)
            || line.starts_with("# HTTP Cookie File")
            || (!entry.starts_with('#') && entry.split('\t').count() >= 7)
    })
}

/// Parses `Set-Cookie` values, one per line or joined with `; `. Plain
/// `Cookie` header strings (`a=1; b=2`) parse as attribute-less cookies.
fn parse_set_cookies(raw: &str) -> Vec<CookieRecord> {
    let mut cookies: Vec<CookieRecord> = Vec::new();

    for line in raw.lines() {
        for segment in line.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = match segment.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (segment, None),
            };
            let lower = key.to_ascii_lowercase();

            if COOKIE_ATTRIBUTES.contains(&lower.as_str()) {
                if let Some(current) = cookies.last_mut() {
                    current.apply_attribute(&lower, value);
                }
            } else if let Some(value) = value
                && !key.is_empty()
            {
                cookies.push(CookieRecord::new(key, value));
            }
        }
    }

    cookies
}

pub fn render_netscape(raw: &str, default_domain: &str) -> String {
    render_netscape_at(raw, default_domain, Utc::now().timestamp())
}

fn render_netscape_at(raw: &str, default_domain: &str, now: i64) -> String {
    if is_netscape_jar(raw) {
        let mut contents = String::with_capacity(raw.len() + NETSCAPE_HEADER.len() + 2);
        let has_header = raw
            .lines()
            .map(str::trim)
            .any(|line| line.starts_with(NETSCAPE_HEADER) || line.starts_with("# HTTP Cookie File"));
        if !has_header {
            contents.push_str(NETSCAPE_HEADER);
            contents.push('\n');
        }
        contents.push_str(raw);
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        return contents;
    }

    let mut contents = String::from(NETSCAPE_HEADER);
    contents.push('\n');
    for cookie in parse_set_cookies(raw) {
        if let Some(line) = cookie.netscape_line(default_domain, now) {
            contents.push_str(&line);
            contents.push('\n');
        }
    }
    contents
}

fn jar_file_name() -> String {
    format!(
        "{JAR_PREFIX}{}_{}{JAR_SUFFIX}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

pub async fn materialize(dir: &Path, credential: &Credential) -> Result<CookieJar, DownloadError> {
    let path = dir.join(jar_file_name());
    let contents = render_netscape(&credential.raw, &credential.default_domain);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(&path)
        .await
        .map_err(DownloadError::CredentialWrite)?;
    // From here on the guard removes a partially written file on failure.
    let jar = CookieJar::adopt(path);

    file.write_all(contents.as_bytes())
        .await
        .map_err(DownloadError::CredentialWrite)?;
    file.flush().await.map_err(DownloadError::CredentialWrite)?;

    info!("Archivo de cookies creado en: {:?}", jar.path());
    Ok(jar)
}
