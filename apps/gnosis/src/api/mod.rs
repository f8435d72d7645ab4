//! # Gnosis HTTP API
//!
//! A thin transport over the messaging layer.
//!
//! ## Endpoints
//!
//! - `POST /message` - Deliver a signed message, receive the signed response
//! - `GET /status` - Subsystem counts and the core's verifying key
//! - `GET /plugins` - Registered operations
//! - `GET /health` - Health check
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `GNOSIS_RATE_LIMIT`: Requests per second (default: 100, 0 to disable)
//! - `GNOSIS_API_KEY`: If set, requires Bearer token authentication

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::get_api_key_from_env;
pub use handlers::{
    health_handler, message_handler, plugins_handler, reject_status, status_handler,
};
pub use middleware::{create_rate_limiter, get_rate_limit_from_env};
pub use types::{ErrorResponse, HealthResponse, PluginEntry, RejectResponse, StatusResponse};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};
use gnosis_core::{GnosisCore, GnosisError};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Largest accepted request body (1 MB).
const MAX_BODY_BYTES: usize = 1024 * 1024;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state. The core synchronizes internally, so handlers share
/// it without an outer lock.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<GnosisCore>,
}

impl AppState {
    #[must_use]
    pub fn new(core: GnosisCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Build the router with all endpoints and middleware.
///
/// Middleware stack (outer to inner): tracing, body limit, rate limiting
/// (if enabled), authentication (if configured).
pub fn create_router(state: AppState) -> Router {
    let rate_limit = get_rate_limit_from_env();
    let rate_limiter = if rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", rate_limit);
        Some(create_rate_limiter(rate_limit))
    } else {
        tracing::info!("Rate limiting disabled");
        None
    };

    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED - transport is open, messages are still \
             signature-checked. Set GNOSIS_API_KEY to require a bearer token."
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/plugins", get(handlers::plugins_handler))
        .route("/message", post(handlers::message_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }

    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve `core` on `addr` until interrupted.
pub async fn run_server(addr: &str, core: GnosisCore) -> Result<(), GnosisError> {
    let router = create_router(AppState::new(core));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GnosisError::Storage(format!("Bind failed: {}", e)))?;

    tracing::info!("Gnosis HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GnosisError::Storage(format!("Server error: {}", e)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
