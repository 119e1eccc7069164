// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! HTTP/WebSocket server: routes, middleware stack, and the upgrade path
//! into the connection server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderValue, StatusCode},
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::auth;
use crate::config::ServerConfig;
use crate::connection;
use crate::error::GatewayResult;
use crate::middleware::{rate_limit_middleware, RateLimitState};
use crate::protocol::envelope::now_ms;
use crate::state::Gateway;

/// Bridge gateway server
pub struct Server {
    config: ServerConfig,
    gateway: Arc<Gateway>,
    listener: TcpListener,
    app: Router,
}

impl Server {
    /// Bind the listener and build the application.
    pub async fn new(config: ServerConfig) -> GatewayResult<Self> {
        let gateway = Gateway::new(config.clone());
        let listener = TcpListener::bind(config.bind_addr).await?;
        let app = Self::build_app(Arc::clone(&gateway), &config);
        Ok(Self {
            config,
            gateway,
            listener,
            app,
        })
    }

    fn build_app(gateway: Arc<Gateway>, config: &ServerConfig) -> Router {
        let middleware_stack = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(config));

        let auth_routes = Router::new()
            .route("/auth/login", post(auth::login))
            .route("/auth/verify", get(auth::verify))
            .route("/auth/refresh", post(auth::refresh))
            .layer(from_fn({
                let rate_limit_state =
                    Arc::new(RateLimitState::new(config.rate_limit.clone()));
                move |req, next| {
                    let state = Arc::clone(&rate_limit_state);
                    rate_limit_middleware(state, req, next)
                }
            }));

        Router::new()
            .route("/health", get(health))
            .route("/ws", get(ws_connect))
            .merge(auth_routes)
            .with_state(gateway)
            .layer(middleware_stack)
    }

    /// Address the listener is actually bound to (port 0 resolves here).
    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap_or(self.config.bind_addr)
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        Arc::clone(&self.gateway)
    }

    /// Run the server until the listener fails.
    pub async fn run(self) -> GatewayResult<()> {
        info!("Starting bridge gateway on {}", self.addr());
        axum::serve(self.listener, self.app).await?;
        Ok(())
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    if config.cors_origin == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origin = config
            .cors_origin
            .parse::<HeaderValue>()
            .unwrap_or_else(|_| HeaderValue::from_static("http://localhost:3000"));
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
            ])
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: u64,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: now_ms(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Query params accepted by the WebSocket endpoint.
#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_connect(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Connection limit guard; token validation happens post-upgrade so the
    // client sees the 1008 close code.
    let permit = match gateway.permits.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => return StatusCode::TOO_MANY_REQUESTS.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let _permit = permit;
        connection::run_connection(socket, gateway, query.token).await;
    })
}
