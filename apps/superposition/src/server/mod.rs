//! User-facing HTTP server: health, session REST glue, and the WebSocket
//! terminal bridge. Repositories, settings and the SPA are external
//! collaborators; the router exposes a fallback seam for them.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::preflight::CliStatus;
use crate::session::SessionManager;

pub mod api;
pub mod ws;

pub use api::{SessionRecord, SessionRegistry, SessionStatus};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<dyn SessionManager>,
    pub registry: Arc<SessionRegistry>,
    pub clis: Arc<Vec<CliStatus>>,
    pub git_ok: bool,
}

impl AppState {
    pub fn new(
        manager: Arc<dyn SessionManager>,
        registry: Arc<SessionRegistry>,
        clis: Vec<CliStatus>,
        git_ok: bool,
    ) -> Self {
        Self {
            manager,
            registry,
            clis: Arc::new(clis),
            git_ok,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/sessions", get(api::list_sessions).post(api::create_session))
        .route("/api/sessions/:id", axum::routing::delete(api::delete_session))
        .route("/ws/session/:id", get(ws::websocket_handler))
        .fallback(spa_fallback)
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// The SPA bundle is supplied by the embedding process; without one, fall
/// back to a plain pointer at the API.
async fn spa_fallback() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "no frontend bundled; the API lives under /api/"})),
    )
}

fn handle_panic(_err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
