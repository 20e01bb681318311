//! Encoder argument construction.
//!
//! Token order is contractual, not cosmetic: hardware-acceleration tokens
//! appear before the input path, the input-side seek before `-i`,
//! codec/bitrate/preset between input and filter graph, container-shaping
//! tokens before the output path, and the output path is always last.
//! The builder never mutates global state and never spawns the encoder.

use std::path::Path;

use crate::models::{EncodingProfile, MediaDescriptor, StreamingContainer};

use super::capabilities::EncoderCapabilities;

/// Builds ordered encoder argument vectors from an encoding profile.
#[derive(Debug, Clone)]
pub struct ArgumentBuilder {
    capabilities: EncoderCapabilities,
    hardware_preference: Vec<String>,
    segment_seconds: u32,
}

impl ArgumentBuilder {
    #[must_use]
    pub const fn new(
        capabilities: EncoderCapabilities,
        hardware_preference: Vec<String>,
        segment_seconds: u32,
    ) -> Self {
        Self {
            capabilities,
            hardware_preference,
            segment_seconds,
        }
    }

    /// Build the argument vector for one encode.
    #[must_use]
    pub fn build(
        &self,
        profile: &EncodingProfile,
        media: &MediaDescriptor,
        input: &Path,
        working_dir: &Path,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".to_string(),
            "-y".to_string(),
            "-nostdin".to_string(),
        ];

        if !profile.remux_only {
            push_hwaccel(&mut args, profile.hardware_accel.as_deref());
        }

        // Input-side seek: decoding never touches content before the offset.
        if profile.seek_offset_seconds > 0 {
            args.push("-ss".to_string());
            args.push(profile.seek_offset_seconds.to_string());
        }

        args.push("-i".to_string());
        args.push(input.to_string_lossy().into_owned());

        let renditions = self.rendition_count(profile);
        if matches!(
            profile.container,
            StreamingContainer::Dash | StreamingContainer::Hls
        ) {
            // First video stream, first audio stream if present.
            for _ in 0..renditions {
                args.push("-map".to_string());
                args.push("0:v:0".to_string());
            }
            args.push("-map".to_string());
            args.push("0:a:0?".to_string());
        }

        if profile.remux_only {
            args.push("-c:v".to_string());
            args.push("copy".to_string());
            args.push("-c:a".to_string());
            args.push("copy".to_string());
        } else {
            self.push_video_args(&mut args, profile, renditions);
            push_audio_args(&mut args, profile, media);
        }

        self.push_container_args(&mut args, profile, renditions, working_dir);

        args.push(
            working_dir
                .join(profile.container.manifest_filename())
                .to_string_lossy()
                .into_owned(),
        );
        args
    }

    /// The retry vector after a hardware failure: hardware tokens stripped,
    /// hardware encoder names mapped to their software equivalents.
    #[must_use]
    pub fn build_software_fallback(
        &self,
        profile: &EncodingProfile,
        media: &MediaDescriptor,
        input: &Path,
        working_dir: &Path,
    ) -> Vec<String> {
        let mut software = profile.clone();
        software.hardware_accel = Some("software".to_string());
        self.build(&software, media, input, working_dir)
    }

    fn rendition_count(&self, profile: &EncodingProfile) -> usize {
        if profile.enable_abr
            && profile.container == StreamingContainer::Dash
            && !profile.remux_only
            && !profile.abr_ladder.is_empty()
        {
            profile.abr_ladder.len()
        } else {
            1
        }
    }

    fn select_encoder(&self, profile: &EncodingProfile) -> &'static str {
        if let Some(backend) = profile.hardware_accel.as_deref() {
            if backend.eq_ignore_ascii_case("software") {
                return EncoderCapabilities::pinned(&profile.video_codec, "software")
                    .unwrap_or("libx264");
            }
            if let Some(encoder) = EncoderCapabilities::pinned(&profile.video_codec, backend) {
                return encoder;
            }
        }
        self.capabilities
            .select(&profile.video_codec, &self.hardware_preference)
            .unwrap_or("libx264")
    }

    fn push_video_args(&self, args: &mut Vec<String>, profile: &EncodingProfile, renditions: usize) {
        let encoder = self.select_encoder(profile);
        args.push("-c:v".to_string());
        args.push(encoder.to_string());

        let software = encoder.starts_with("lib");
        match profile.preset.as_deref() {
            Some(preset) => {
                args.push("-preset".to_string());
                args.push(preset.to_string());
            }
            None if software => {
                args.push("-preset".to_string());
                args.push("veryfast".to_string());
            }
            None if encoder.ends_with("_nvenc") => {
                args.push("-preset".to_string());
                args.push("p4".to_string());
            }
            None => {}
        }

        if renditions > 1 {
            for (i, rung) in profile.abr_ladder.iter().enumerate() {
                args.push(format!("-b:v:{i}"));
                args.push(format!("{}k", rung.bitrate_kbps));
                args.push(format!("-filter:v:{i}"));
                args.push(format!("scale=-2:{}", rung.height));
            }
            return;
        }

        if let Some(bitrate) = profile.target_bitrate_kbps {
            args.push("-b:v".to_string());
            args.push(format!("{bitrate}k"));
            args.push("-maxrate".to_string());
            args.push(format!("{bitrate}k"));
            args.push("-bufsize".to_string());
            args.push(format!("{}k", bitrate * 2));
        } else if let Some(crf) = profile.quality_crf {
            if software {
                args.push("-crf".to_string());
            } else {
                args.push("-qp".to_string());
            }
            args.push(crf.to_string());
        }

        if let Some(resolution) = profile.target_resolution {
            args.push("-vf".to_string());
            args.push(format!("scale=-2:{}", resolution.height));
        }
    }

    fn push_container_args(
        &self,
        args: &mut Vec<String>,
        profile: &EncodingProfile,
        renditions: usize,
        working_dir: &Path,
    ) {
        let seg = self.segment_seconds.to_string();
        match profile.container {
            StreamingContainer::Dash => {
                args.push("-f".to_string());
                args.push("dash".to_string());
                args.push("-seg_duration".to_string());
                args.push(seg);
                args.push("-use_template".to_string());
                args.push("1".to_string());
                args.push("-use_timeline".to_string());
                args.push("1".to_string());
                args.push("-init_seg_name".to_string());
                args.push("init-$RepresentationID$.m4s".to_string());
                args.push("-media_seg_name".to_string());
                args.push("chunk-$RepresentationID$-$Number%05d$.m4s".to_string());
                if renditions > 1 {
                    args.push("-adaptation_sets".to_string());
                    args.push("id=0,streams=v id=1,streams=a".to_string());
                }
            }
            StreamingContainer::Hls => {
                args.push("-f".to_string());
                args.push("hls".to_string());
                args.push("-hls_time".to_string());
                args.push(seg);
                args.push("-hls_playlist_type".to_string());
                args.push("vod".to_string());
                args.push("-hls_segment_filename".to_string());
                args.push(
                    working_dir
                        .join("segment-%05d.ts")
                        .to_string_lossy()
                        .into_owned(),
                );
            }
            StreamingContainer::Mp4 => {
                // Index at the front so playback can start before the
                // download finishes.
                args.push("-movflags".to_string());
                args.push("+faststart".to_string());
            }
        }
    }
}

fn push_hwaccel(args: &mut Vec<String>, pinned: Option<&str>) {
    match pinned.map(str::to_ascii_lowercase).as_deref() {
        Some("software") => {}
        Some("nvenc" | "cuda") => {
            args.push("-hwaccel".to_string());
            args.push("cuda".to_string());
        }
        Some("vaapi") => {
            args.push("-hwaccel".to_string());
            args.push("vaapi".to_string());
            args.push("-vaapi_device".to_string());
            args.push("/dev/dri/renderD128".to_string());
        }
        Some("qsv") => {
            args.push("-hwaccel".to_string());
            args.push("qsv".to_string());
        }
        Some("videotoolbox") => {
            args.push("-hwaccel".to_string());
            args.push("videotoolbox".to_string());
        }
        _ => {
            args.push("-hwaccel".to_string());
            args.push("auto".to_string());
        }
    }
}

fn push_audio_args(args: &mut Vec<String>, profile: &EncodingProfile, media: &MediaDescriptor) {
    args.push("-c:a".to_string());
    args.push(profile.audio_codec.to_ascii_lowercase());
    args.push("-b:a".to_string());
    args.push("128k".to_string());

    // Browsers reliably decode stereo AAC; multichannel support is spotty.
    if profile.audio_codec.eq_ignore_ascii_case("aac") && media.audio_channels > 2 {
        args.push("-ac".to_string());
        args.push("2".to_string());
        args.push("-af".to_string());
        args.push("aformat=channel_layouts=stereo".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AbrRendition, Resolution};
    use std::path::PathBuf;

    fn builder() -> ArgumentBuilder {
        ArgumentBuilder::new(
            EncoderCapabilities::from_names(["libx264", "libx265", "libsvtav1", "h264_nvenc"]),
            vec!["software".to_string(), "nvenc".to_string()],
            4,
        )
    }

    fn media() -> MediaDescriptor {
        MediaDescriptor {
            container: "mkv".to_string(),
            video_codec: "hevc".to_string(),
            audio_codec: "ac3".to_string(),
            audio_channels: 6,
            duration_seconds: 5400.0,
            width: 1920,
            height: 1080,
            bitrate_kbps: 8000,
            size_bytes: 5_400_000_000,
        }
    }

    fn input() -> PathBuf {
        PathBuf::from("/media/movie.mkv")
    }

    fn workdir() -> PathBuf {
        PathBuf::from("/tmp/work")
    }

    fn index_of(args: &[String], token: &str) -> usize {
        args.iter()
            .position(|a| a == token)
            .unwrap_or_else(|| panic!("token {token} missing from {args:?}"))
    }

    #[test]
    fn output_path_is_last_and_hwaccel_precedes_input() {
        let profile = EncodingProfile::basic(StreamingContainer::Dash);
        let args = builder().build(&profile, &media(), &input(), &workdir());

        assert!(index_of(&args, "-hwaccel") < index_of(&args, "-i"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("/tmp/work/manifest.mpd")
        );
    }

    #[test]
    fn seek_offset_is_input_side() {
        let mut profile = EncodingProfile::basic(StreamingContainer::Dash);
        profile.seek_offset_seconds = 300;
        let args = builder().build(&profile, &media(), &input(), &workdir());

        let ss = index_of(&args, "-ss");
        assert_eq!(args[ss + 1], "300");
        assert!(ss < index_of(&args, "-i"));
    }

    #[test]
    fn no_seek_token_at_offset_zero() {
        let profile = EncodingProfile::basic(StreamingContainer::Dash);
        let args = builder().build(&profile, &media(), &input(), &workdir());
        assert!(!args.iter().any(|a| a == "-ss"));
    }

    #[test]
    fn dash_shaping_tokens() {
        let profile = EncodingProfile::basic(StreamingContainer::Dash);
        let args = builder().build(&profile, &media(), &input(), &workdir());

        let f = index_of(&args, "-f");
        assert_eq!(args[f + 1], "dash");
        let seg = index_of(&args, "-seg_duration");
        assert_eq!(args[seg + 1], "4");
        assert!(args.iter().any(|a| a == "-use_template"));
        assert!(args.iter().any(|a| a == "-use_timeline"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "0:v:0"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "0:a:0?"));
    }

    #[test]
    fn hls_shaping_tokens() {
        let profile = EncodingProfile::basic(StreamingContainer::Hls);
        let args = builder().build(&profile, &media(), &input(), &workdir());

        let f = index_of(&args, "-f");
        assert_eq!(args[f + 1], "hls");
        let time = index_of(&args, "-hls_time");
        assert_eq!(args[time + 1], "4");
        let playlist_type = index_of(&args, "-hls_playlist_type");
        assert_eq!(args[playlist_type + 1], "vod");
        assert_eq!(
            args.last().map(String::as_str),
            Some("/tmp/work/playlist.m3u8")
        );
    }

    #[test]
    fn mp4_gets_faststart() {
        let profile = EncodingProfile::basic(StreamingContainer::Mp4);
        let args = builder().build(&profile, &media(), &input(), &workdir());

        let flags = index_of(&args, "-movflags");
        assert_eq!(args[flags + 1], "+faststart");
        assert!(index_of(&args, "-movflags") < args.len() - 1);
    }

    #[test]
    fn multichannel_aac_source_is_downmixed_to_stereo() {
        let profile = EncodingProfile::basic(StreamingContainer::Dash);
        let args = builder().build(&profile, &media(), &input(), &workdir());

        let ac = index_of(&args, "-ac");
        assert_eq!(args[ac + 1], "2");
        assert!(args.iter().any(|a| a.contains("channel_layouts=stereo")));
    }

    #[test]
    fn stereo_source_is_not_downmixed() {
        let mut stereo = media();
        stereo.audio_channels = 2;
        let profile = EncodingProfile::basic(StreamingContainer::Dash);
        let args = builder().build(&profile, &stereo, &input(), &workdir());
        assert!(!args.iter().any(|a| a == "-ac"));
    }

    #[test]
    fn remux_copies_streams() {
        let mut profile = EncodingProfile::basic(StreamingContainer::Mp4);
        profile.remux_only = true;
        let args = builder().build(&profile, &media(), &input(), &workdir());

        let cv = index_of(&args, "-c:v");
        assert_eq!(args[cv + 1], "copy");
        let ca = index_of(&args, "-c:a");
        assert_eq!(args[ca + 1], "copy");
        assert!(!args.iter().any(|a| a == "-hwaccel"));
    }

    #[test]
    fn pinned_nvenc_emits_cuda_and_nvenc_encoder() {
        let mut profile = EncodingProfile::basic(StreamingContainer::Dash);
        profile.hardware_accel = Some("nvenc".to_string());
        let args = builder().build(&profile, &media(), &input(), &workdir());

        let hw = index_of(&args, "-hwaccel");
        assert_eq!(args[hw + 1], "cuda");
        let cv = index_of(&args, "-c:v");
        assert_eq!(args[cv + 1], "h264_nvenc");
    }

    #[test]
    fn software_fallback_strips_hardware_tokens() {
        let mut profile = EncodingProfile::basic(StreamingContainer::Dash);
        profile.hardware_accel = Some("nvenc".to_string());
        let b = builder();
        let args = b.build_software_fallback(&profile, &media(), &input(), &workdir());

        assert!(!args.iter().any(|a| a == "-hwaccel"));
        assert!(!args.iter().any(|a| a.contains("nvenc")));
        let cv = index_of(&args, "-c:v");
        assert_eq!(args[cv + 1], "libx264");
    }

    #[test]
    fn abr_ladder_maps_one_video_stream_per_rendition() {
        let mut profile = EncodingProfile::basic(StreamingContainer::Dash);
        profile.enable_abr = true;
        profile.quality_crf = None;
        profile.abr_ladder = vec![
            AbrRendition {
                height: 1080,
                bitrate_kbps: 5000,
            },
            AbrRendition {
                height: 720,
                bitrate_kbps: 3000,
            },
        ];
        let args = builder().build(&profile, &media(), &input(), &workdir());

        let video_maps = args
            .windows(2)
            .filter(|w| w[0] == "-map" && w[1] == "0:v:0")
            .count();
        assert_eq!(video_maps, 2);
        assert!(args.iter().any(|a| a == "-b:v:0"));
        assert!(args.iter().any(|a| a == "-b:v:1"));
        assert!(args.iter().any(|a| a == "scale=-2:720"));
        assert!(args.iter().any(|a| a == "-adaptation_sets"));
    }

    #[test]
    fn resolution_cap_becomes_scale_filter() {
        let mut profile = EncodingProfile::basic(StreamingContainer::Dash);
        profile.target_resolution = Some(Resolution::new(1280, 720));
        let args = builder().build(&profile, &media(), &input(), &workdir());

        let vf = index_of(&args, "-vf");
        assert_eq!(args[vf + 1], "scale=-2:720");
        assert!(index_of(&args, "-c:v") < vf);
    }
}
