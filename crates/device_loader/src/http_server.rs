//! HTTP status API
//!
//! Every GET returns the loader status as pretty-printed JSON, whatever the
//! path. Browsers on other origins may poll it; the request origin is echoed
//! back.

use crate::loader::Loader;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub loader: Arc<Loader>,
    pub include_output: bool,
}

/// GET /* - Loader status
async fn get_status(State(state): State<AppState>) -> Response {
    let mut status = state.loader.status();
    if !state.include_output {
        status = status.without_output();
    }

    match status.to_pretty_json() {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            log::error!("Failed to serialize status: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /health - Health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

/// Create the HTTP router
pub fn create_router(loader: Arc<Loader>, include_output: bool) -> Router {
    let state = AppState {
        loader,
        include_output,
    };

    let cors = CorsLayer::new().allow_origin(AllowOrigin::mirror_request());

    // axum answers HEAD through the GET handlers and drops the body
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(get_status))
        .route("/{*path}", get(get_status))
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server until shutdown
pub async fn run_http_server(
    loader: Arc<Loader>,
    port: u16,
    include_output: bool,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(loader, include_output);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    log::info!("HTTP server listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    log::info!("HTTP server stopped");
    Ok(())
}
