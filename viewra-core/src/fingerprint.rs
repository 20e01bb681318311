//! Content fingerprint derivation.
//!
//! The fingerprint is the dedup key for the content store: a pure function
//! of (source media identity, canonicalised encoding profile, streaming
//! format set), independent of time, session identity and host. Two
//! requests that would render byte-equivalent output hash identically; any
//! parameter that changes rendered bytes changes the hash.

use sha2::{Digest, Sha256};

use crate::models::{EncodingProfile, MediaId};

/// Derive the content fingerprint for a transcode request.
///
/// Canonicalisation: fixed key order, lower-cased tokens, bitrates in kbps,
/// seek offset in whole seconds, formats sorted and deduplicated.
#[must_use]
pub fn generate_content_hash(
    media_id: &MediaId,
    profile: &EncodingProfile,
    formats: &[String],
) -> String {
    let canonical = canonical_form(media_id, profile, formats);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

fn canonical_form(media_id: &MediaId, profile: &EncodingProfile, formats: &[String]) -> String {
    let mut formats: Vec<String> = formats.iter().map(|f| f.to_ascii_lowercase()).collect();
    formats.sort();
    formats.dedup();

    let resolution = profile
        .target_resolution
        .map_or_else(|| "source".to_string(), |r| r.to_string());
    let bitrate = profile
        .target_bitrate_kbps
        .map_or_else(|| "source".to_string(), |b| format!("{b}kbps"));
    let crf = profile
        .quality_crf
        .map_or_else(|| "none".to_string(), |c| c.to_string());
    let preset = profile
        .preset
        .as_deref()
        .unwrap_or("default")
        .to_ascii_lowercase();
    let hwaccel = profile
        .hardware_accel
        .as_deref()
        .unwrap_or("auto")
        .to_ascii_lowercase();

    let mut ladder = String::new();
    for rung in &profile.abr_ladder {
        ladder.push_str(&format!("{}p@{}kbps;", rung.height, rung.bitrate_kbps));
    }

    // Keys are emitted in fixed sorted order; adding a field means slotting
    // it alphabetically so old and new builds disagree loudly, not subtly.
    format!(
        "abr={}|acodec={}|bitrate={}|container={}|crf={}|formats={}|hwaccel={}|ladder={}|media={}|preset={}|remux={}|resolution={}|seek={}|vcodec={}",
        u8::from(profile.enable_abr),
        profile.audio_codec.to_ascii_lowercase(),
        bitrate,
        profile.container.as_str(),
        crf,
        formats.join(","),
        hwaccel,
        ladder,
        media_id.as_str(),
        preset,
        u8::from(profile.remux_only),
        resolution,
        profile.seek_offset_seconds,
        profile.video_codec.to_ascii_lowercase(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Resolution, StreamingContainer};

    fn profile() -> EncodingProfile {
        EncodingProfile {
            target_resolution: Some(Resolution::new(1920, 1080)),
            target_bitrate_kbps: Some(5000),
            ..EncodingProfile::basic(StreamingContainer::Dash)
        }
    }

    #[test]
    fn deterministic_across_calls() {
        let media = MediaId::from("m42");
        let formats = vec!["dash".to_string()];
        let a = generate_content_hash(&media, &profile(), &formats);
        let b = generate_content_hash(&media, &profile(), &formats);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn format_order_and_case_do_not_matter() {
        let media = MediaId::from("m42");
        let a = generate_content_hash(
            &media,
            &profile(),
            &["dash".to_string(), "hls".to_string()],
        );
        let b = generate_content_hash(
            &media,
            &profile(),
            &["HLS".to_string(), "Dash".to_string()],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn every_rendered_parameter_changes_the_hash() {
        let media = MediaId::from("m42");
        let formats = vec!["dash".to_string()];
        let base = generate_content_hash(&media, &profile(), &formats);

        let mut p = profile();
        p.target_bitrate_kbps = Some(3000);
        assert_ne!(base, generate_content_hash(&media, &p, &formats));

        let mut p = profile();
        p.target_resolution = Some(Resolution::new(1280, 720));
        assert_ne!(base, generate_content_hash(&media, &p, &formats));

        let mut p = profile();
        p.seek_offset_seconds = 300;
        assert_ne!(base, generate_content_hash(&media, &p, &formats));

        let mut p = profile();
        p.video_codec = "hevc".to_string();
        assert_ne!(base, generate_content_hash(&media, &p, &formats));

        let mut p = profile();
        p.remux_only = true;
        assert_ne!(base, generate_content_hash(&media, &p, &formats));

        let other_media = MediaId::from("m43");
        assert_ne!(base, generate_content_hash(&other_media, &profile(), &formats));
    }

    #[test]
    fn codec_case_is_normalised() {
        let media = MediaId::from("m42");
        let formats = vec!["dash".to_string()];
        let mut upper = profile();
        upper.video_codec = "H264".to_string();
        assert_eq!(
            generate_content_hash(&media, &profile(), &formats),
            generate_content_hash(&media, &upper, &formats)
        );
    }
}
