use std::{collections::HashMap, net::SocketAddr};

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::error::ApiError;

const WINDOW_SECONDS: i64 = 60;
const MAX_TRACKED_CLIENTS: usize = 20_000;

type RateLimitMap = HashMap<String, Vec<DateTime<Utc>>>;

/// Sliding one-minute window of download requests per client IP.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    entries: Mutex<RateLimitMap>,
}

impl RateLimiter {
    /// A limit of zero disables the limiter.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    pub async fn register(&self, ip: &str) -> Result<(), ApiError> {
        self.register_at(ip, Utc::now()).await
    }

    async fn register_at(&self, ip: &str, now: DateTime<Utc>) -> Result<(), ApiError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let window_start = now - Duration::seconds(WINDOW_SECONDS);
        let mut entries = self.entries.lock().await;

        if entries.len() > MAX_TRACKED_CLIENTS {
            entries.retain(|_, timestamps| {
                timestamps.retain(|timestamp| *timestamp > window_start);
                !timestamps.is_empty()
            });
        }

        let timestamps = entries.entry(ip.to_string()).or_default();
        timestamps.retain(|timestamp| *timestamp > window_start);

        if timestamps.len() >= self.limit {
            let reset_at = timestamps
                .first()
                .map(|oldest| *oldest + Duration::seconds(WINDOW_SECONDS))
                .unwrap_or(now);
            let retry_after_seconds = (reset_at - now).num_seconds().max(1) as u64;
            return Err(ApiError::rate_limited(self.limit, retry_after_seconds));
        }

        timestamps.push(now);
        Ok(())
    }
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

pub fn client_ip(headers: &HeaderMap, addr: Option<SocketAddr>, trust_proxy_headers: bool) -> String {
    let socket_ip = addr.map(|addr| addr.ip().to_string());
    if trust_proxy_headers {
        extract_client_ip(headers)
            .or(socket_ip)
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        socket_ip.unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, StatusCode};

    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(2);
        let now = Utc::now();

        limiter.register_at("10.0.0.1", now).await.unwrap();
        limiter.register_at("10.0.0.1", now).await.unwrap();
        let error = limiter.register_at("10.0.0.1", now).await.unwrap_err();

        assert_eq!(error.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error.retry_after_seconds, Some(60));
    }

    #[tokio::test]
    async fn clients_are_counted_separately() {
        let limiter = RateLimiter::new(1);
        let now = Utc::now();

        limiter.register_at("10.0.0.1", now).await.unwrap();
        limiter.register_at("10.0.0.2", now).await.unwrap();
    }

    #[tokio::test]
    async fn window_slides() {
        let limiter = RateLimiter::new(1);
        let start = Utc::now();

        limiter.register_at("10.0.0.1", start).await.unwrap();
        assert!(limiter.register_at("10.0.0.1", start + Duration::seconds(30)).await.is_err());
        limiter
            .register_at("10.0.0.1", start + Duration::seconds(61))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_limit_disables() {
        let limiter = RateLimiter::new(0);
        for _ in 0..500 {
            limiter.register("10.0.0.1").await.unwrap();
        }
    }

    #[test]
    fn proxy_headers_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let addr = Some(SocketAddr::from(([127, 0, 0, 1], 4000)));

        assert_eq!(client_ip(&headers, addr, true), "203.0.113.9");
        assert_eq!(client_ip(&headers, addr, false), "127.0.0.1");
        assert_eq!(client_ip(&HeaderMap::new(), None, false), "unknown");
    }
}
