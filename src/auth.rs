//! Token issuance, verification, and refresh.
//!
//! HS256 bearer tokens with a static demo credential pair. Refresh accepts
//! tokens expired within a 24-hour grace window; signature failures are
//! always hard-rejected.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::state::Gateway;

/// Window after expiry during which a token may still be refreshed.
pub const REFRESH_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies bearer tokens against the configured secret.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expires_in: i64,
    username: String,
    password: String,
}

impl TokenService {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            expires_in: config.jwt_expires_in as i64,
            username: config.auth_username.clone(),
            password: config.auth_password.clone(),
        }
    }

    /// Check the demo credential pair and issue a token.
    pub fn login(&self, username: &str, password: &str) -> GatewayResult<String> {
        if username == self.username && password == self.password {
            self.issue(username)
        } else {
            Err(GatewayError::Auth("Invalid credentials".to_string()))
        }
    }

    pub fn issue(&self, sub: &str) -> GatewayResult<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            iat: now,
            exp: now + self.expires_in,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| GatewayError::Internal(format!("token encoding failed: {e}")))
    }

    /// Validate signature and expiry.
    pub fn verify(&self, token: &str) -> GatewayResult<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| GatewayError::Auth("Invalid token".to_string()))
    }

    /// Re-issue a token whose signature is valid and whose expiry lies within
    /// [`REFRESH_GRACE`].
    pub fn refresh(&self, token: &str) -> GatewayResult<String> {
        let mut validation = Validation::default();
        validation.validate_exp = false;
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| GatewayError::Auth("Invalid token".to_string()))?;

        let now = chrono::Utc::now().timestamp();
        if data.claims.exp + (REFRESH_GRACE.as_secs() as i64) < now {
            return Err(GatewayError::Auth(
                "Token expired beyond the refresh grace period".to_string(),
            ));
        }
        self.issue(&data.claims.sub)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
    pub username: String,
    pub expires_at: i64,
}

/// `POST /auth/login`
pub async fn login(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<LoginRequest>,
) -> GatewayResult<Json<TokenResponse>> {
    let token = gateway.tokens.login(&request.username, &request.password)?;
    Ok(Json(TokenResponse { token }))
}

/// `GET /auth/verify`
pub async fn verify(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> GatewayResult<Json<VerifyResponse>> {
    let token = bearer_token(&headers)
        .ok_or_else(|| GatewayError::Auth("Missing bearer token".to_string()))?;
    let claims = gateway.tokens.verify(token)?;
    Ok(Json(VerifyResponse {
        valid: true,
        username: claims.sub,
        expires_at: claims.exp,
    }))
}

/// `POST /auth/refresh`
pub async fn refresh(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<RefreshRequest>,
) -> GatewayResult<Json<TokenResponse>> {
    let token = gateway.tokens.refresh(&request.token)?;
    Ok(Json(TokenResponse { token }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(&ServerConfig {
            jwt_secret: "test-secret".to_string(),
            jwt_expires_in: 3600,
            ..ServerConfig::default()
        })
    }

    fn token_with_exp(svc: &TokenService, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "demo".to_string(),
            iat: now,
            exp: now + exp_offset,
        };
        encode(&Header::default(), &claims, &svc.encoding).unwrap()
    }

    #[test]
    fn login_issues_verifiable_token() {
        let svc = service();
        let token = svc.login("demo", "demo").expect("login");
        let claims = svc.verify(&token).expect("verify");
        assert_eq!(claims.sub, "demo");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_credentials_are_rejected() {
        let svc = service();
        assert!(svc.login("demo", "wrong").is_err());
        assert!(svc.login("intruder", "demo").is_err());
    }

    #[test]
    fn expired_token_fails_verify_but_refreshes_within_grace() {
        let svc = service();
        // Expired two hours ago: verify rejects, refresh re-issues.
        let expired = token_with_exp(&svc, -7200);
        assert!(svc.verify(&expired).is_err());
        let refreshed = svc.refresh(&expired).expect("refresh within grace");
        assert!(svc.verify(&refreshed).is_ok());
    }

    #[test]
    fn refresh_beyond_grace_is_rejected() {
        let svc = service();
        let stale = token_with_exp(&svc, -(REFRESH_GRACE.as_secs() as i64 + 3600));
        assert!(svc.refresh(&stale).is_err());
    }

    #[test]
    fn signature_failures_are_hard_rejected() {
        let svc = service();
        let other = TokenService::new(&ServerConfig {
            jwt_secret: "different-secret".to_string(),
            ..ServerConfig::default()
        });
        let foreign = other.issue("demo").unwrap();
        assert!(svc.verify(&foreign).is_err());
        assert!(svc.refresh(&foreign).is_err());
    }
}
