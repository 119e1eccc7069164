//! Custom middleware

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;

/// Sliding-window rate limiting state
#[derive(Clone)]
pub struct RateLimitState {
    requests: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
    config: RateLimitConfig,
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            requests: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Check if a request from `key` is allowed within the window.
    pub async fn check_rate_limit(&self, key: &str) -> bool {
        let mut requests = self.requests.lock().await;
        let now = Instant::now();

        let client_requests = requests.entry(key.to_string()).or_default();

        let window_start = now - self.config.window;
        client_requests.retain(|&time| time > window_start);

        if (client_requests.len() as u64) < self.config.max_requests {
            client_requests.push(now);
            true
        } else {
            false
        }
    }
}

/// Rate limiting middleware keyed by forwarded client address.
pub async fn rate_limit_middleware(
    state: Arc<RateLimitState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let client_key = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("local");

    if state.check_rate_limit(client_key).await {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::TOO_MANY_REQUESTS)
    }
}
