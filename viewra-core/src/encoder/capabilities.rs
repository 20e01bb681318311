//! Encoder capability probing.
//!
//! The encoder binary is probed once per process lifetime (`-encoders`
//! listing); everything downstream consults the cached set. Tests inject
//! fixed sets via [`EncoderCapabilities::from_names`].

use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

/// Abstract codec name -> concrete encoder, per acceleration backend.
/// Software entries lead for Docker stability; the order callers actually
/// apply comes from the configured preference list.
const ENCODER_TABLE: &[(&str, &str, &str)] = &[
    ("h264", "software", "libx264"),
    ("h264", "nvenc", "h264_nvenc"),
    ("h264", "vaapi", "h264_vaapi"),
    ("h264", "qsv", "h264_qsv"),
    ("h264", "videotoolbox", "h264_videotoolbox"),
    ("hevc", "software", "libx265"),
    ("hevc", "nvenc", "hevc_nvenc"),
    ("hevc", "vaapi", "hevc_vaapi"),
    ("hevc", "qsv", "hevc_qsv"),
    ("hevc", "videotoolbox", "hevc_videotoolbox"),
    ("av1", "software", "libsvtav1"),
    ("av1", "nvenc", "av1_nvenc"),
    ("av1", "vaapi", "av1_vaapi"),
    ("av1", "qsv", "av1_qsv"),
];

/// The set of named encoders the binary reports.
#[derive(Debug, Clone)]
pub struct EncoderCapabilities {
    names: HashSet<String>,
}

static PROBED: OnceCell<EncoderCapabilities> = OnceCell::new();

impl EncoderCapabilities {
    /// Build from a fixed list of encoder names (tests, pinned deployments).
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Probe the binary's `-encoders` listing, cached for the process
    /// lifetime. A failed probe yields the software encoders only, so the
    /// builder still produces a usable vector.
    pub fn probe(ffmpeg_path: &Path) -> &'static Self {
        PROBED.get_or_init(|| match Self::detect(ffmpeg_path) {
            Ok(caps) => caps,
            Err(e) => {
                warn!(error = %e, "encoder probe failed, assuming software encoders only");
                Self::from_names(["libx264", "libx265", "libsvtav1", "aac"])
            }
        })
    }

    fn detect(ffmpeg_path: &Path) -> std::io::Result<Self> {
        let output = std::process::Command::new(ffmpeg_path)
            .args(["-hide_banner", "-encoders"])
            .output()?;
        let listing = String::from_utf8_lossy(&output.stdout);

        // Listing lines look like " V....D libx264  H.264 / AVC ...";
        // the encoder name is the second column.
        let names: HashSet<String> = listing
            .lines()
            .filter_map(|line| {
                let mut cols = line.split_whitespace();
                let flags = cols.next()?;
                if !(flags.starts_with('V') || flags.starts_with('A')) {
                    return None;
                }
                cols.next().map(str::to_string)
            })
            .collect();
        debug!(count = names.len(), "probed encoder capabilities");
        Ok(Self { names })
    }

    #[must_use]
    pub fn has(&self, encoder: &str) -> bool {
        self.names.contains(encoder)
    }

    /// Pick the concrete encoder for an abstract codec, walking the
    /// preference list and skipping backends the binary lacks. Falls back
    /// to the software encoder even when unprobed: a missing libx264 is a
    /// fatal environment problem better surfaced by the encoder itself.
    #[must_use]
    pub fn select(&self, codec: &str, preference: &[String]) -> Option<&'static str> {
        let codec = codec.to_ascii_lowercase();
        for backend in preference {
            if let Some(encoder) = encoder_for(&codec, backend) {
                if self.has(encoder) {
                    return Some(encoder);
                }
            }
        }
        encoder_for(&codec, "software")
    }

    /// Concrete encoder for a pinned acceleration backend, ignoring
    /// availability (the caller asked for exactly this one).
    #[must_use]
    pub fn pinned(codec: &str, backend: &str) -> Option<&'static str> {
        encoder_for(&codec.to_ascii_lowercase(), &backend.to_ascii_lowercase())
    }
}

fn encoder_for(codec: &str, backend: &str) -> Option<&'static str> {
    ENCODER_TABLE
        .iter()
        .find(|(c, b, _)| *c == codec && *b == backend)
        .map(|(_, _, encoder)| *encoder)
}

/// Software equivalent for a hardware encoder name; identity for software
/// encoders. Used to build the fallback vector after a hardware failure.
#[must_use]
pub fn software_equivalent(encoder: &str) -> &str {
    match encoder {
        e if e.starts_with("h264_") => "libx264",
        e if e.starts_with("hevc_") => "libx265",
        e if e.starts_with("av1_") => "libsvtav1",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn software_only() -> EncoderCapabilities {
        EncoderCapabilities::from_names(["libx264", "libx265", "libsvtav1"])
    }

    fn preference(backends: &[&str]) -> Vec<String> {
        backends.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn software_first_preference_picks_libx264() {
        let caps = EncoderCapabilities::from_names(["libx264", "h264_nvenc"]);
        let pref = preference(&["software", "nvenc"]);
        assert_eq!(caps.select("h264", &pref), Some("libx264"));
    }

    #[test]
    fn hardware_preferred_when_promoted_and_present() {
        let caps = EncoderCapabilities::from_names(["libx264", "h264_nvenc"]);
        let pref = preference(&["nvenc", "software"]);
        assert_eq!(caps.select("h264", &pref), Some("h264_nvenc"));
    }

    #[test]
    fn missing_hardware_backend_is_skipped() {
        let caps = software_only();
        let pref = preference(&["nvenc", "vaapi", "software"]);
        assert_eq!(caps.select("h264", &pref), Some("libx264"));
        assert_eq!(caps.select("hevc", &pref), Some("libx265"));
        assert_eq!(caps.select("av1", &pref), Some("libsvtav1"));
    }

    #[test]
    fn unknown_codec_selects_nothing() {
        let caps = software_only();
        let pref = preference(&["software"]);
        assert_eq!(caps.select("theora", &pref), None);
    }

    #[test]
    fn software_equivalents() {
        assert_eq!(software_equivalent("h264_nvenc"), "libx264");
        assert_eq!(software_equivalent("hevc_vaapi"), "libx265");
        assert_eq!(software_equivalent("av1_qsv"), "libsvtav1");
        assert_eq!(software_equivalent("libx264"), "libx264");
    }
}
