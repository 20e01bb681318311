//! Playback control HTTP API
//!
//! Decide, start, inspect, stop and seek-ahead for transcoding sessions.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::http::{AppError, AppResult, AppState};
use viewra_core::models::{
    DeviceProfile, EncodingProfile, MediaId, PlayMethod, ProgressUpdate, Resolution, Session,
    SessionId, StreamingContainer, TranscodeRequest,
};

/// Decide direct play / remux / transcode for a media + device pair
#[axum::debug_handler]
pub async fn decide(
    State(state): State<AppState>,
    Json(req): Json<DecideHttpRequest>,
) -> AppResult<impl IntoResponse> {
    if req.media_path.is_empty() {
        return Err(AppError::bad_request("media_path must not be empty"));
    }
    let decision = state
        .session_manager
        .decide(&req.media_path, &req.device_profile)
        .await?;

    Ok(Json(DecideResponse {
        method: decision.method,
        reason: decision.reason,
        direct_play_url: decision.direct_play_url,
        transcode_params: decision.transcode_params.map(TranscodeParams::from),
    }))
}

/// Start (or attach to) a transcoding session
#[axum::debug_handler]
pub async fn start(
    State(state): State<AppState>,
    Json(req): Json<StartHttpRequest>,
) -> AppResult<impl IntoResponse> {
    let session = start_session(&state, req).await?;
    Ok(Json(StartResponse::from(session)))
}

/// Deprecated alias for [`start`]; kept for clients still on the old path.
#[axum::debug_handler]
pub async fn start_deprecated(
    State(state): State<AppState>,
    Json(req): Json<StartHttpRequest>,
) -> AppResult<impl IntoResponse> {
    tracing::warn!("POST /api/playback/session/start is deprecated, use /api/playback/start");
    let session = start_session(&state, req).await?;
    Ok(Json(StartResponse::from(session)))
}

async fn start_session(state: &AppState, req: StartHttpRequest) -> AppResult<Session> {
    if req.media_file_id.is_empty() {
        return Err(AppError::bad_request("media_file_id must not be empty"));
    }
    let container = match &req.container {
        Some(raw) => StreamingContainer::parse(raw)?,
        None => StreamingContainer::Dash,
    };

    let mut profile = EncodingProfile::basic(container);
    profile.enable_abr = req.enable_abr;
    if let Some(codec) = req.video_codec {
        profile.video_codec = codec.to_ascii_lowercase();
    }
    if let Some(codec) = req.audio_codec {
        profile.audio_codec = codec.to_ascii_lowercase();
    }
    if let Some(label) = &req.target_resolution {
        profile.target_resolution = Some(Resolution::from_label(label).ok_or_else(|| {
            AppError::bad_request(format!("unknown resolution label: {label}"))
        })?);
    }
    if let Some(bitrate) = req.target_bitrate_kbps {
        profile.target_bitrate_kbps = Some(bitrate);
    }
    if let Some(backend) = req.hardware_accel {
        profile.hardware_accel = Some(backend.to_ascii_lowercase());
    }
    if let Some(seek) = req.seek_position {
        profile.seek_offset_seconds = seek;
    }

    let media_ref = req.media_path.as_deref().unwrap_or(&req.media_file_id);
    let media_path = state.session_manager.resolve_source(media_ref)?;

    let session = state
        .session_manager
        .start(TranscodeRequest {
            media_id: MediaId::from(req.media_file_id),
            media_path,
            profile,
            formats: Vec::new(),
            provider: req.provider,
        })
        .await?;
    Ok(session)
}

/// Session snapshot including status and progress
#[axum::debug_handler]
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let session = state
        .session_manager
        .get_session(&SessionId::from_string(id))?;
    Ok(Json(SessionResponse::from(session)))
}

/// Snapshot of every live session
#[axum::debug_handler]
pub async fn list_sessions(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let sessions: Vec<SessionResponse> = state
        .session_manager
        .list_sessions()
        .into_iter()
        .map(SessionResponse::from)
        .collect();
    Ok(Json(sessions))
}

/// Terminate one session
#[axum::debug_handler]
pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let session = state
        .session_manager
        .stop(&SessionId::from_string(id))
        .await?;
    Ok(Json(SessionResponse::from(session)))
}

/// Terminate all sessions
#[axum::debug_handler]
pub async fn stop_all(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let stopped_count = state.session_manager.stop_all().await;
    Ok(Json(serde_json::json!({ "stopped_count": stopped_count })))
}

/// Create a sibling session encoding from a later position
#[axum::debug_handler]
pub async fn seek_ahead(
    State(state): State<AppState>,
    Json(req): Json<SeekAheadRequest>,
) -> AppResult<impl IntoResponse> {
    let session = state
        .session_manager
        .seek_ahead(&SessionId::from_string(req.session_id), req.seek_position)
        .await?;
    Ok(Json(StartResponse::from(session)))
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DecideHttpRequest {
    pub media_path: String,
    #[serde(default)]
    pub device_profile: DeviceProfile,
}

#[derive(Debug, Serialize)]
pub struct DecideResponse {
    pub method: PlayMethod,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_play_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode_params: Option<TranscodeParams>,
}

/// Flattened encoding profile for decide responses.
#[derive(Debug, Serialize)]
pub struct TranscodeParams {
    pub target_container: String,
    pub target_video_codec: String,
    pub target_audio_codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_bitrate_kbps: Option<u64>,
    pub remux_only: bool,
    pub enable_abr: bool,
}

impl From<EncodingProfile> for TranscodeParams {
    fn from(profile: EncodingProfile) -> Self {
        Self {
            target_container: profile.container.as_str().to_string(),
            target_video_codec: profile.video_codec,
            target_audio_codec: profile.audio_codec,
            target_resolution: profile.target_resolution.map(|r| r.to_string()),
            target_bitrate_kbps: profile.target_bitrate_kbps,
            remux_only: profile.remux_only,
            enable_abr: profile.enable_abr,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartHttpRequest {
    pub media_file_id: String,
    /// Explicit source path; defaults to resolving `media_file_id`
    #[serde(default)]
    pub media_path: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub enable_abr: bool,
    #[serde(default)]
    pub seek_position: Option<u64>,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub target_resolution: Option<String>,
    #[serde(default)]
    pub target_bitrate_kbps: Option<u64>,
    #[serde(default)]
    pub hardware_accel: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub id: String,
    pub status: String,
    pub manifest_url: String,
    pub content_hash: String,
    pub content_url: String,
    pub provider: String,
}

impl From<Session> for StartResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id.to_string(),
            status: session.status.to_string(),
            manifest_url: session.manifest_url(),
            content_hash: session.fingerprint.clone(),
            content_url: session.content_url(),
            provider: session.provider,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub status: String,
    pub provider: String,
    pub content_hash: String,
    pub content_url: String,
    pub manifest_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id.to_string(),
            status: session.status.to_string(),
            provider: session.provider.clone(),
            content_hash: session.fingerprint.clone(),
            content_url: session.content_url(),
            manifest_url: session.manifest_url(),
            progress: session.progress,
            error: session.error,
            created_at: session.created_at,
            ended_at: session.ended_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SeekAheadRequest {
    pub session_id: String,
    pub seek_position: u64,
}
