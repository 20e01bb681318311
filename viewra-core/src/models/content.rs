// Content store record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MediaId;

/// Metadata persisted alongside published content, one `metadata.json`
/// per store leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub fingerprint: String,
    pub media_id: MediaId,
    /// Manifest filename(s) inside the leaf (manifest.mpd / playlist.m3u8)
    pub manifests: Vec<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ContentRecord {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
