// Media probe results, device capabilities and encoding targets.
//
// All codec and container names are normalised to lower case on the wire.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::MediaId;

/// Immutable probe result for a source file.
///
/// Produced by a provider's probe step; consumed by the decision engine and
/// the argument builder. Never mutated after probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Container format (e.g. "mp4", "mkv")
    pub container: String,
    /// Video codec (e.g. "h264", "hevc")
    pub video_codec: String,
    /// Audio codec (e.g. "aac", "ac3")
    pub audio_codec: String,
    /// Audio channel count (2 = stereo, 6 = 5.1, 8 = 7.1)
    pub audio_channels: u32,
    /// Duration in seconds
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    /// Overall bitrate in kbps
    pub bitrate_kbps: u64,
    /// File size in bytes
    pub size_bytes: u64,
}

impl MediaDescriptor {
    /// Human channel-layout name for the probed channel count.
    #[must_use]
    pub fn channel_layout(&self) -> &'static str {
        match self.audio_channels {
            1 => "mono",
            2 => "stereo",
            6 => "5.1",
            8 => "7.1",
            _ => "other",
        }
    }
}

/// Client capabilities, supplied per request and never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    /// Supported containers (e.g. ["mp4", "webm"])
    pub containers: Vec<String>,
    /// Supported video codecs
    pub video_codecs: Vec<String>,
    /// Supported audio codecs
    pub audio_codecs: Vec<String>,
    /// Supported channel layouts; empty means "no constraint"
    pub audio_channel_layouts: Vec<String>,
    /// Maximum resolution label (e.g. "1080p", "4k")
    pub max_resolution: String,
    /// Maximum bitrate in kbps (0 = unconstrained)
    pub max_bitrate: u64,
    pub supports_hdr: bool,
    pub supports_hevc: bool,
    pub supports_av1: bool,
    /// User-agent hint, used only for container preference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl DeviceProfile {
    fn contains_ci(haystack: &[String], needle: &str) -> bool {
        haystack.iter().any(|h| h.eq_ignore_ascii_case(needle))
    }

    #[must_use]
    pub fn supports_container(&self, container: &str) -> bool {
        Self::contains_ci(&self.containers, container)
    }

    #[must_use]
    pub fn supports_video_codec(&self, codec: &str) -> bool {
        Self::contains_ci(&self.video_codecs, codec)
    }

    #[must_use]
    pub fn supports_audio_codec(&self, codec: &str) -> bool {
        Self::contains_ci(&self.audio_codecs, codec)
    }

    /// Channel-layout check applies only when the device enumerates layouts.
    #[must_use]
    pub fn supports_channel_layout(&self, layout: &str) -> bool {
        self.audio_channel_layouts.is_empty()
            || Self::contains_ci(&self.audio_channel_layouts, layout)
    }

    /// Parsed maximum resolution; `None` when the device sets no limit.
    #[must_use]
    pub fn max_resolution_parsed(&self) -> Option<Resolution> {
        if self.max_resolution.is_empty() {
            None
        } else {
            Resolution::from_label(&self.max_resolution)
        }
    }

    /// Whether the user-agent hints at an HLS-preferring platform.
    #[must_use]
    pub fn prefers_hls(&self) -> bool {
        self.user_agent.as_deref().is_some_and(|ua| {
            let ua = ua.to_ascii_lowercase();
            (ua.contains("safari") && !ua.contains("chrome"))
                || ua.contains("iphone")
                || ua.contains("ipad")
                || ua.contains("appletv")
        })
    }
}

/// A video resolution value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse a resolution label ("1080p", "4k", "1920x1080").
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        match label.as_str() {
            "8k" | "4320p" => return Some(Self::new(7680, 4320)),
            "4k" | "2160p" | "uhd" => return Some(Self::new(3840, 2160)),
            "1440p" | "2k" => return Some(Self::new(2560, 1440)),
            "1080p" | "fhd" => return Some(Self::new(1920, 1080)),
            "720p" | "hd" => return Some(Self::new(1280, 720)),
            "480p" | "sd" => return Some(Self::new(854, 480)),
            "360p" => return Some(Self::new(640, 360)),
            _ => {}
        }
        if let Some((w, h)) = label.split_once('x') {
            if let (Ok(w), Ok(h)) = (w.parse(), h.parse()) {
                return Some(Self::new(w, h));
            }
        }
        None
    }

    /// True when this resolution fits inside `other`.
    #[must_use]
    pub const fn fits_within(&self, other: &Self) -> bool {
        self.width <= other.width && self.height <= other.height
    }

    #[must_use]
    pub fn min(self, other: Self) -> Self {
        if self.height <= other.height {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Output container for a transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingContainer {
    Mp4,
    Dash,
    Hls,
}

impl StreamingContainer {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Dash => "dash",
            Self::Hls => "hls",
        }
    }

    /// Manifest filename the encoder produces for this container.
    #[must_use]
    pub const fn manifest_filename(&self) -> &'static str {
        match self {
            Self::Mp4 => "output.mp4",
            Self::Dash => "manifest.mpd",
            Self::Hls => "playlist.m3u8",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "dash" => Ok(Self::Dash),
            "hls" => Ok(Self::Hls),
            other => Err(crate::Error::Validation(format!(
                "unknown container: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for StreamingContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rung of an adaptive-bitrate ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbrRendition {
    pub height: u32,
    pub bitrate_kbps: u64,
}

/// Target parameters for one encode.
///
/// Produced by the decision engine or supplied by the caller; input to the
/// argument builder and the content fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingProfile {
    pub container: StreamingContainer,
    /// Abstract video codec name ("h264", "hevc", "av1")
    pub video_codec: String,
    /// Abstract audio codec name ("aac", "opus")
    pub audio_codec: String,
    /// Target resolution; `None` keeps the source resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_resolution: Option<Resolution>,
    /// Target video bitrate in kbps; `None` uses CRF-only rate control
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_bitrate_kbps: Option<u64>,
    /// Constant-rate-factor quality (lower = better)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_crf: Option<u8>,
    /// Encoder preset name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default)]
    pub enable_abr: bool,
    /// ABR ladder; only meaningful when `enable_abr` is set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub abr_ladder: Vec<AbrRendition>,
    /// Input-side seek offset in seconds
    #[serde(default)]
    pub seek_offset_seconds: u64,
    /// Copy elementary streams, only rewrap the container
    #[serde(default)]
    pub remux_only: bool,
    /// Pinned hardware acceleration backend ("nvenc", "vaapi", ...);
    /// `None` lets the builder pick per its preference list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_accel: Option<String>,
}

impl EncodingProfile {
    /// A plain software H.264/AAC profile for the given container.
    #[must_use]
    pub fn basic(container: StreamingContainer) -> Self {
        Self {
            container,
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            target_resolution: None,
            target_bitrate_kbps: None,
            quality_crf: Some(23),
            preset: None,
            enable_abr: false,
            abr_ladder: Vec::new(),
            seek_offset_seconds: 0,
            remux_only: false,
            hardware_accel: None,
        }
    }
}

/// How the engine decided the client should play the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMethod {
    Direct,
    Remux,
    Transcode,
}

impl std::fmt::Display for PlayMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Remux => f.write_str("remux"),
            Self::Transcode => f.write_str("transcode"),
        }
    }
}

/// Decision engine output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackDecision {
    pub method: PlayMethod,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_play_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode_params: Option<EncodingProfile>,
}

/// A fully-resolved request to produce content for a fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub media_id: MediaId,
    /// Absolute path to the source file
    pub media_path: PathBuf,
    pub profile: EncodingProfile,
    /// Streaming formats rendered by this request (normally just the
    /// profile's container; ABR runs may render several)
    pub formats: Vec<String>,
    /// Provider to run the encode with; `None` selects the default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_labels_parse() {
        assert_eq!(
            Resolution::from_label("1080p"),
            Some(Resolution::new(1920, 1080))
        );
        assert_eq!(
            Resolution::from_label("4K"),
            Some(Resolution::new(3840, 2160))
        );
        assert_eq!(
            Resolution::from_label("1280x720"),
            Some(Resolution::new(1280, 720))
        );
        assert_eq!(Resolution::from_label("potato"), None);
    }

    #[test]
    fn device_profile_checks_are_case_insensitive() {
        let device = DeviceProfile {
            containers: vec!["MP4".to_string()],
            video_codecs: vec!["H264".to_string()],
            ..DeviceProfile::default()
        };
        assert!(device.supports_container("mp4"));
        assert!(device.supports_video_codec("h264"));
        assert!(!device.supports_audio_codec("aac"));
    }

    #[test]
    fn empty_layout_list_means_unconstrained() {
        let device = DeviceProfile::default();
        assert!(device.supports_channel_layout("5.1"));
    }

    #[test]
    fn safari_prefers_hls() {
        let mut device = DeviceProfile {
            user_agent: Some(
                "Mozilla/5.0 (Macintosh) AppleWebKit/605.1.15 Version/17.0 Safari/605.1.15"
                    .to_string(),
            ),
            ..DeviceProfile::default()
        };
        assert!(device.prefers_hls());

        device.user_agent = Some("Mozilla/5.0 Chrome/126.0 Safari/537.36".to_string());
        assert!(!device.prefers_hls());
    }
}
