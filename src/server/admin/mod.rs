// src/server/admin/mod.rs

//! The JSON-over-HTTP administrative control surface.

pub mod auth;
pub mod handlers;

use crate::core::state::{ControlEvent, Runtime};
use crate::core::watchdog::WatchdogHandle;
use axum::Router;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Shared state for the admin handlers.
pub struct AdminState {
    pub runtime: Arc<Runtime>,
    pub watchdog: Option<Arc<WatchdogHandle>>,
}

/// Bearer/basic authentication for everything except `/auth/login`.
async fn require_auth(
    State(state): State<Arc<AdminState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let config = state.runtime.config();
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth::authorize(
        header_value,
        &config.admin.jwt_secret,
        &config.admin.username,
        &config.admin.password,
    ) {
        Ok(_subject) => next.run(request).await,
        Err(e) => handlers::AdminError {
            status: StatusCode::UNAUTHORIZED,
            message: e.to_string(),
        }
        .into_response(),
    }
}

/// Runs the admin HTTP server until a shutdown control event.
pub async fn run(runtime: Arc<Runtime>, watchdog: Option<Arc<WatchdogHandle>>) {
    let config = runtime.config();
    let mut shutdown_rx = runtime.subscribe_control();
    let state = Arc::new(AdminState { runtime, watchdog });

    let protected = Router::new()
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/nodes", get(handlers::nodes))
        .route("/api/v1/nodes/{id}", get(handlers::node))
        .route("/api/v1/nodes/{id}/{action}", post(handlers::node_action))
        .route("/api/v1/processes", get(handlers::processes))
        .route("/api/v1/health/stats", get(handlers::health_stats))
        .route("/api/v1/control/{action}", post(handlers::control))
        .route("/api/v1/cache/invalidate", post(handlers::cache_invalidate))
        .route("/api/v1/watchdog/info", get(handlers::watchdog_info))
        .route("/api/v1/watchdog/status", get(handlers::watchdog_status))
        .route("/api/v1/watchdog/{action}", post(handlers::watchdog_action))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let app = Router::new()
        .route("/api/v1/auth/login", post(handlers::login))
        .merge(protected)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.admin.port));
    info!("Admin surface listening on http://{addr}/api/v1");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind admin server on port {}: {e}", config.admin.port);
            return;
        }
    };

    let shutdown = async move {
        loop {
            match shutdown_rx.recv().await {
                Ok(ControlEvent::Shutdown(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        info!("Admin surface shutting down.");
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Admin server error: {e}");
    }
}
