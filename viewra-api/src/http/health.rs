// Liveness / readiness endpoint.

use axum::{extract::State, response::IntoResponse, Json};

use crate::http::{AppResult, AppState};

#[axum::debug_handler]
pub async fn health(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let store_writable = state.store.root().exists();
    let active_sessions = state
        .session_manager
        .list_sessions()
        .iter()
        .filter(|s| !s.status.is_terminal())
        .count();

    Ok(Json(serde_json::json!({
        "status": if store_writable { "ok" } else { "degraded" },
        "content_store_writable": store_writable,
        "active_sessions": active_sessions,
    })))
}
