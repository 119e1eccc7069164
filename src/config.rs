//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,

    /// Secret used to sign and verify bearer tokens
    pub jwt_secret: String,

    /// Token lifetime in seconds
    pub jwt_expires_in: u64,

    /// Static demo credential pair
    pub auth_username: String,
    pub auth_password: String,

    /// Allowed CORS origin; "*" allows any
    pub cors_origin: String,

    /// Full agent launch command override (binary + args, whitespace
    /// separated). When unset the binary is discovered by probing.
    pub agent_cmd: Option<String>,

    /// Maximum concurrent WebSocket connections
    pub connection_limit: usize,

    /// Rate limiting configuration for the auth routes
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3100".parse().unwrap(),
            jwt_secret: "dev-secret-change-me".to_string(),
            jwt_expires_in: 3600,
            auth_username: "demo".to_string(),
            auth_password: "demo".to_string(),
            cors_origin: "*".to_string(),
            agent_cmd: None,
            connection_limit: 256,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `PORT`, `HOST`, `JWT_SECRET`, `JWT_EXPIRES_IN`,
    /// `CORS_ORIGIN`, `RATE_LIMIT_MAX`, `RATE_LIMIT_WINDOW_MS`,
    /// `BRIDGE_AGENT_CMD`, `AUTH_USERNAME`, `AUTH_PASSWORD`. `LOG_LEVEL` is
    /// consumed by the logging init in `main`, not here.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(3100);
        if let Ok(addr) = format!("{}:{}", host, port).parse() {
            config.bind_addr = addr;
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.is_empty() {
                config.jwt_secret = secret;
            }
        }
        if let Some(expires) = std::env::var("JWT_EXPIRES_IN")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.jwt_expires_in = expires;
        }
        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            if !origin.is_empty() {
                config.cors_origin = origin;
            }
        }
        if let Ok(cmd) = std::env::var("BRIDGE_AGENT_CMD") {
            if !cmd.trim().is_empty() {
                config.agent_cmd = Some(cmd);
            }
        }
        if let Ok(user) = std::env::var("AUTH_USERNAME") {
            if !user.is_empty() {
                config.auth_username = user;
            }
        }
        if let Ok(pass) = std::env::var("AUTH_PASSWORD") {
            if !pass.is_empty() {
                config.auth_password = pass;
            }
        }

        if let Some(max) = std::env::var("RATE_LIMIT_MAX")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.rate_limit.max_requests = max;
        }
        if let Some(window) = std::env::var("RATE_LIMIT_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.rate_limit.window = Duration::from_millis(window);
        }

        config
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window per client
    pub max_requests: u64,

    /// Sliding window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 3100);
        assert_eq!(config.auth_username, "demo");
        assert!(config.agent_cmd.is_none());
        assert_eq!(config.rate_limit.max_requests, 100);
    }
}
