// Module: http
// HTTP/JSON REST surface for playback control and content serving

pub mod content;
pub mod error;
pub mod health;
pub mod playback;

use axum::{
    http::HeaderValue,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use viewra_core::session::SessionManager;
use viewra_core::store::ContentStore;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<viewra_core::Config>,
    pub session_manager: Arc<SessionManager>,
    pub store: Arc<ContentStore>,
}

/// Build the HTTP router.
///
/// Control routes get a request timeout; content routes stream segments
/// and stay unbounded (range downloads outlive any sane request timeout).
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_seconds);

    let control = Router::new()
        .route("/health", get(health::health))
        .route("/api/playback/decide", post(playback::decide))
        .route("/api/playback/start", post(playback::start))
        // Deprecated alias, scheduled for removal.
        .route(
            "/api/playback/session/start",
            post(playback::start_deprecated),
        )
        .route("/api/playback/sessions", get(playback::list_sessions))
        .route(
            "/api/playback/session/{id}",
            get(playback::get_session).delete(playback::stop_session),
        )
        .route("/api/playback/sessions/all", delete(playback::stop_all))
        .route("/api/playback/seek-ahead", post(playback::seek_ahead))
        .layer(TimeoutLayer::new(timeout));

    let content = Router::new()
        .route("/api/v1/content/{fingerprint}/info", get(content::content_info))
        .route(
            "/api/v1/content/{fingerprint}/{*file}",
            get(content::serve_content),
        )
        .route(
            "/api/v1/sessions/{session_id}/{*file}",
            get(content::serve_session_file),
        );

    Router::new()
        .merge(control)
        .merge(content)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(cors_layer(&state.config.server.cors_allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}
