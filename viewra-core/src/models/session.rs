// Session state machine types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{SessionId, TranscodeRequest};

/// Session lifecycle status.
///
/// Permitted transitions:
///
/// ```text
///   queued -> starting -> running -> publishing -> completed
///               |            |           |
///               v            v           v
///            failed       failed      failed
///   (any non-terminal) -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Queued,
    Starting,
    Running,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving to `next` from here.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Queued, Self::Starting)
            | (Self::Starting, Self::Running)
            | (Self::Running, Self::Publishing)
            | (Self::Publishing, Self::Completed)
            | (Self::Starting | Self::Running | Self::Publishing, Self::Failed) => true,
            (current, Self::Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Publishing => "publishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Structured progress snapshot for a running encode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Percent complete in [0, 100]; derived from encoded time over the
    /// probed duration when the duration is known
    pub percent_complete: f64,
    /// Wall-clock seconds since the encoder started
    pub time_elapsed_seconds: f64,
    /// Current encode speed as a realtime multiple
    pub current_speed: f64,
    /// Moving mean of the observed speeds
    pub average_speed: f64,
    /// Output bytes written so far
    pub bytes_written: u64,
    pub frames: u64,
    pub fps: f64,
    pub bitrate_kbps: f64,
    /// Estimated seconds remaining; absent until percent and speed are known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
}

/// One transcoding attempt. Persisted; survives restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub fingerprint: String,
    /// Name of the provider that ran (or will run) the encode;
    /// `"content-reuse"` for dedup hits served from the content store
    pub provider: String,
    pub status: SessionStatus,
    pub request: TranscodeRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressUpdate>,
    /// Non-empty once the session fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Backing directory while encoding; ownership moves to the content
    /// store at publish
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Leaf directory in the content store after publish
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_path: Option<PathBuf>,
    /// Encoder pid while one is running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl Session {
    #[must_use]
    pub fn new(fingerprint: String, provider: String, request: TranscodeRequest) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            fingerprint,
            provider,
            status: SessionStatus::Queued,
            request,
            progress: None,
            error: None,
            created_at: now,
            last_accessed_at: now,
            ended_at: None,
            working_dir: None,
            published_path: None,
            pid: None,
        }
    }

    /// Content base URL for this session's fingerprint.
    #[must_use]
    pub fn content_url(&self) -> String {
        format!("/api/v1/content/{}/", self.fingerprint)
    }

    /// Manifest URL the client should poll. Published content is addressed
    /// by fingerprint; while encoding the transitional session URL is the
    /// only guaranteed read path.
    #[must_use]
    pub fn manifest_url(&self) -> String {
        let manifest = self.request.profile.container.manifest_filename();
        if self.status == SessionStatus::Completed {
            format!("/api/v1/content/{}/{manifest}", self.fingerprint)
        } else {
            format!("/api/v1/sessions/{}/{manifest}", self.id)
        }
    }
}
