//! Playback decision engine.
//!
//! Given a media probe and a device profile, picks direct play, remux or
//! transcode. Rules are evaluated in order and the first match wins; there
//! is no "incompatible device" outcome — a transcode path always exists.

use tracing::debug;

use crate::models::{
    AbrRendition, DeviceProfile, EncodingProfile, MediaDescriptor, PlayMethod, PlaybackDecision,
    Resolution, StreamingContainer,
};
use crate::{Error, Result};

/// Default ABR ladder rungs, capped per device/source below.
const ABR_LADDER: &[AbrRendition] = &[
    AbrRendition {
        height: 1080,
        bitrate_kbps: 5000,
    },
    AbrRendition {
        height: 720,
        bitrate_kbps: 3000,
    },
    AbrRendition {
        height: 480,
        bitrate_kbps: 1500,
    },
    AbrRendition {
        height: 360,
        bitrate_kbps: 800,
    },
];

#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionEngine;

impl DecisionEngine {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decide how the device should play the media.
    pub fn decide(
        &self,
        media: &MediaDescriptor,
        device: &DeviceProfile,
    ) -> Result<PlaybackDecision> {
        validate_descriptor(media)?;

        let container_ok = device.supports_container(&media.container);
        let video_ok = device.supports_video_codec(&media.video_codec);
        let audio_ok = device.supports_audio_codec(&media.audio_codec);
        let layout_ok = device.supports_channel_layout(media.channel_layout());

        let source_resolution = Resolution::new(media.width, media.height);
        let resolution_ok = device
            .max_resolution_parsed()
            .is_none_or(|max| source_resolution.fits_within(&max));
        let bitrate_ok = device.max_bitrate == 0 || media.bitrate_kbps <= device.max_bitrate;

        if container_ok && video_ok && audio_ok && layout_ok && resolution_ok && bitrate_ok {
            return Ok(PlaybackDecision {
                method: PlayMethod::Direct,
                reason: "direct play supported".to_string(),
                direct_play_url: None,
                transcode_params: None,
            });
        }

        if video_ok && audio_ok && layout_ok && resolution_ok && bitrate_ok {
            // Streams are fine, only the wrapper is wrong.
            let mut params = EncodingProfile::basic(remux_container(device));
            params.remux_only = true;
            params.video_codec = media.video_codec.to_ascii_lowercase();
            params.audio_codec = media.audio_codec.to_ascii_lowercase();
            params.quality_crf = None;
            return Ok(PlaybackDecision {
                method: PlayMethod::Remux,
                reason: format!("container {} not supported, remuxing", media.container),
                direct_play_url: None,
                transcode_params: Some(params),
            });
        }

        let reason = transcode_reason(
            media,
            video_ok,
            audio_ok,
            layout_ok,
            resolution_ok,
            bitrate_ok,
        );
        debug!(%reason, "transcoding required");
        Ok(PlaybackDecision {
            method: PlayMethod::Transcode,
            reason,
            direct_play_url: None,
            transcode_params: Some(self.recommended_transcode_params(media, device, false)),
        })
    }

    /// The full encoding profile the engine would pick for this pair,
    /// including the ABR ladder when enabled.
    #[must_use]
    pub fn recommended_transcode_params(
        &self,
        media: &MediaDescriptor,
        device: &DeviceProfile,
        enable_abr: bool,
    ) -> EncodingProfile {
        let source = Resolution::new(media.width, media.height);
        let target_resolution = device
            .max_resolution_parsed()
            .map_or(source, |max| source.min(max));

        let target_bitrate_kbps = match (media.bitrate_kbps, device.max_bitrate) {
            (0, 0) => None,
            (0, max) => Some(max),
            (src, 0) => Some(src),
            (src, max) => Some(src.min(max)),
        };

        let container = if device.prefers_hls() {
            StreamingContainer::Hls
        } else {
            StreamingContainer::Dash
        };

        let abr_ladder = if enable_abr {
            abr_ladder_for(target_resolution, target_bitrate_kbps)
        } else {
            Vec::new()
        };

        EncodingProfile {
            container,
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            target_resolution: Some(target_resolution),
            target_bitrate_kbps,
            quality_crf: Some(23),
            preset: None,
            enable_abr,
            abr_ladder,
            seek_offset_seconds: 0,
            remux_only: false,
            hardware_accel: None,
        }
    }
}

fn validate_descriptor(media: &MediaDescriptor) -> Result<()> {
    if media.duration_seconds <= 0.0
        || media.container.is_empty()
        || media.video_codec.is_empty()
        || media.width == 0
        || media.height == 0
    {
        return Err(Error::Unsupported("unsupported source".to_string()));
    }
    Ok(())
}

/// Remux target: the first device container this core can produce.
fn remux_container(device: &DeviceProfile) -> StreamingContainer {
    for container in &device.containers {
        if let Ok(parsed) = StreamingContainer::parse(container) {
            return parsed;
        }
    }
    StreamingContainer::Mp4
}

fn transcode_reason(
    media: &MediaDescriptor,
    video_ok: bool,
    audio_ok: bool,
    layout_ok: bool,
    resolution_ok: bool,
    bitrate_ok: bool,
) -> String {
    let mut causes = Vec::new();
    if !video_ok {
        causes.push(format!("video codec {} not supported", media.video_codec));
    }
    if !audio_ok {
        causes.push(format!("audio codec {} not supported", media.audio_codec));
    }
    if !layout_ok {
        causes.push(format!("channel layout {} not supported", media.channel_layout()));
    }
    if !resolution_ok {
        causes.push(format!("resolution {}x{} exceeds device maximum", media.width, media.height));
    }
    if !bitrate_ok {
        causes.push(format!("bitrate {} kbps exceeds device maximum", media.bitrate_kbps));
    }
    if causes.is_empty() {
        "transcoding required".to_string()
    } else {
        format!("transcoding required: {}", causes.join(", "))
    }
}

/// Default ladder capped to a target resolution and bitrate. Always yields
/// at least one rung.
#[must_use]
pub fn abr_ladder_for(target: Resolution, max_bitrate: Option<u64>) -> Vec<AbrRendition> {
    let mut ladder: Vec<AbrRendition> = ABR_LADDER
        .iter()
        .filter(|rung| rung.height <= target.height)
        .map(|rung| AbrRendition {
            height: rung.height,
            bitrate_kbps: max_bitrate.map_or(rung.bitrate_kbps, |max| rung.bitrate_kbps.min(max)),
        })
        .collect();
    if ladder.is_empty() {
        ladder.push(AbrRendition {
            height: target.height,
            bitrate_kbps: max_bitrate.unwrap_or(800),
        });
    }
    ladder
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_media() -> MediaDescriptor {
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

    fn browser_device() -> DeviceProfile {
        DeviceProfile {
            containers: vec!["mp4".to_string(), "webm".to_string()],
            video_codecs: vec!["h264".to_string()],
            audio_codecs: vec!["aac".to_string()],
            max_resolution: "1080p".to_string(),
            max_bitrate: 8000,
            ..DeviceProfile::default()
        }
    }

    #[test]
    fn compatible_source_direct_plays() {
        let decision = DecisionEngine::new()
            .decide(&h264_media(), &browser_device())
            .expect("decide");
        assert_eq!(decision.method, PlayMethod::Direct);
        assert_eq!(decision.reason, "direct play supported");
        assert!(decision.transcode_params.is_none());
    }

    #[test]
    fn unsupported_container_remuxes() {
        let mut media = h264_media();
        media.container = "mkv".to_string();
        let decision = DecisionEngine::new()
            .decide(&media, &browser_device())
            .expect("decide");

        assert_eq!(decision.method, PlayMethod::Remux);
        let params = decision.transcode_params.expect("remux params");
        assert!(params.remux_only);
        assert_eq!(params.container, StreamingContainer::Mp4);
    }

    #[test]
    fn unsupported_codec_transcodes() {
        let mut media = h264_media();
        media.video_codec = "hevc".to_string();
        let decision = DecisionEngine::new()
            .decide(&media, &browser_device())
            .expect("decide");

        assert_eq!(decision.method, PlayMethod::Transcode);
        assert!(decision.reason.contains("hevc"));
        let params = decision.transcode_params.expect("transcode params");
        assert_eq!(params.video_codec, "h264");
        assert_eq!(params.audio_codec, "aac");
        assert!(!params.remux_only);
    }

    #[test]
    fn oversize_source_transcodes_with_capped_target() {
        let mut media = h264_media();
        media.width = 3840;
        media.height = 2160;
        media.bitrate_kbps = 20000;
        let decision = DecisionEngine::new()
            .decide(&media, &browser_device())
            .expect("decide");

        assert_eq!(decision.method, PlayMethod::Transcode);
        let params = decision.transcode_params.expect("transcode params");
        assert_eq!(params.target_resolution, Some(Resolution::new(1920, 1080)));
        assert_eq!(params.target_bitrate_kbps, Some(8000));
    }

    #[test]
    fn channel_layout_constraint_applies_when_enumerated() {
        let mut media = h264_media();
        media.audio_channels = 6;
        let mut device = browser_device();
        device.audio_channel_layouts = vec!["stereo".to_string()];

        let decision = DecisionEngine::new().decide(&media, &device).expect("decide");
        assert_eq!(decision.method, PlayMethod::Transcode);
        assert!(decision.reason.contains("channel layout"));
    }

    #[test]
    fn probe_garbage_is_unsupported_source() {
        let mut media = h264_media();
        media.duration_seconds = 0.0;
        let err = DecisionEngine::new()
            .decide(&media, &browser_device())
            .expect_err("unsupported");
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn abr_ladder_respects_device_caps() {
        let params = DecisionEngine::new().recommended_transcode_params(
            &h264_media(),
            &browser_device(),
            true,
        );
        assert!(params.enable_abr);
        assert_eq!(params.abr_ladder.len(), 4);
        assert!(params.abr_ladder.iter().all(|r| r.height <= 1080));
        assert!(params.abr_ladder.iter().all(|r| r.bitrate_kbps <= 8000));
    }

    #[test]
    fn hls_for_apple_platforms_dash_otherwise() {
        let mut device = browser_device();
        let dash = DecisionEngine::new().recommended_transcode_params(&h264_media(), &device, false);
        assert_eq!(dash.container, StreamingContainer::Dash);

        device.user_agent = Some("AppleTV11,1/11.1".to_string());
        let hls = DecisionEngine::new().recommended_transcode_params(&h264_media(), &device, false);
        assert_eq!(hls.container, StreamingContainer::Hls);
    }
}
