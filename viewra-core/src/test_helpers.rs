//! Test helpers and fixtures for viewra-core tests
//!
//! Fixture builders for descriptors, device profiles and transcode
//! requests, shared between unit and integration tests.

use std::path::PathBuf;

use crate::models::{
    DeviceProfile, EncodingProfile, MediaDescriptor, MediaId, StreamingContainer, TranscodeRequest,
};

/// A plain 1080p H.264/AAC source descriptor.
#[must_use]
pub fn h264_descriptor() -> MediaDescriptor {
    MediaDescriptor {
        container: "mp4".to_string(),
        video_codec: "h264".to_string(),
        audio_codec: "aac".to_string(),
        audio_channels: 2,
        duration_seconds: 5400.0,
        width: 1920,
        height: 1080,
        bitrate_kbps: 5000,
        size_bytes: 4_000_000_000,
    }
}

/// Fixture builder for transcode requests.
pub struct RequestFixture {
    media_id: MediaId,
    media_path: PathBuf,
    profile: EncodingProfile,
    provider: Option<String>,
}

impl RequestFixture {
    #[must_use]
    pub fn new(media_id: &str) -> Self {
        Self {
            media_id: MediaId::from(media_id),
            media_path: PathBuf::from(format!("/media/{media_id}.mkv")),
            profile: EncodingProfile::basic(StreamingContainer::Dash),
            provider: None,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.media_path = path.into();
        self
    }

    #[must_use]
    pub fn with_container(mut self, container: StreamingContainer) -> Self {
        self.profile.container = container;
        self
    }

    #[must_use]
    pub fn with_seek(mut self, seconds: u64) -> Self {
        self.profile.seek_offset_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_hwaccel(mut self, backend: &str) -> Self {
        self.profile.hardware_accel = Some(backend.to_string());
        self
    }

    #[must_use]
    pub fn with_abr(mut self) -> Self {
        self.profile.enable_abr = true;
        self
    }

    #[must_use]
    pub fn build(self) -> TranscodeRequest {
        TranscodeRequest {
            media_id: self.media_id,
            media_path: self.media_path,
            formats: vec![self.profile.container.as_str().to_string()],
            profile: self.profile,
            provider: self.provider,
        }
    }
}

/// A browser-ish device profile supporting H.264/AAC in mp4 up to 1080p.
#[must_use]
pub fn browser_device() -> DeviceProfile {
    DeviceProfile {
        containers: vec!["mp4".to_string(), "webm".to_string()],
        video_codecs: vec!["h264".to_string()],
        audio_codecs: vec!["aac".to_string()],
        max_resolution: "1080p".to_string(),
        max_bitrate: 8000,
        ..DeviceProfile::default()
    }
}
