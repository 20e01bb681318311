//! FFmpeg-backed transcoding provider.
//!
//! Probes with `ffprobe -print_format json`; spawns the encoder in its own
//! process group with stderr piped into the progress parser and tee'd to a
//! per-session `encoder.log`.

use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TranscodingConfig;
use crate::encoder::{ArgumentBuilder, EncoderCapabilities, ProgressParser};
use crate::models::MediaDescriptor;
use crate::{Error, Result};

use super::{EncodeEvent, SpawnSpec, SpawnedEncode, TranscodingProvider};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct FfmpegProvider {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
    builder: ArgumentBuilder,
    stderr_tail_lines: usize,
}

impl FfmpegProvider {
    /// Construct with capabilities probed from the configured binary
    /// (cached for the process lifetime).
    #[must_use]
    pub fn new(cfg: &TranscodingConfig) -> Self {
        let capabilities = EncoderCapabilities::probe(&cfg.ffmpeg_path).clone();
        Self::with_capabilities(cfg, capabilities)
    }

    /// Construct with an injected capability set (tests, pinned deploys).
    #[must_use]
    pub fn with_capabilities(cfg: &TranscodingConfig, capabilities: EncoderCapabilities) -> Self {
        Self {
            ffmpeg_path: cfg.ffmpeg_path.clone(),
            ffprobe_path: cfg.ffprobe_path.clone(),
            builder: ArgumentBuilder::new(
                capabilities,
                cfg.hardware_preference.clone(),
                cfg.segment_seconds,
            ),
            stderr_tail_lines: cfg.stderr_tail_lines,
        }
    }
}

#[async_trait]
impl TranscodingProvider for FfmpegProvider {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn probe(&self, path: &Path) -> Result<MediaDescriptor> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::Fatal(format!(
                    "probe binary {} not found",
                    self.ffprobe_path.display()
                )),
                _ => Error::Transient(format!("probe launch failed: {e}")),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Unsupported(format!(
                "unsupported source {}: {}",
                path.display(),
                stderr.trim()
            )));
        }
        parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedEncode> {
        let args = if spec.force_software {
            self.builder.build_software_fallback(
                &spec.profile,
                &spec.media,
                &spec.input,
                &spec.working_dir,
            )
        } else {
            self.builder
                .build(&spec.profile, &spec.media, &spec.input, &spec.working_dir)
        };
        debug!(?args, "spawning encoder");

        let log_path = spec.working_dir.join("encoder.log");
        let mut log_file = std::fs::File::create(&log_path)
            .map_err(|e| Error::Transient(format!("failed to create encoder log: {e}")))?;

        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::Fatal(format!(
                "encoder binary {} not found",
                self.ffmpeg_path.display()
            )),
            _ => Error::Transient(format!("encoder launch failed: {e}")),
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Transient("encoder exited before pid was observed".to_string()))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transient("encoder stderr unavailable".to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let duration = (spec.media.duration_seconds
            - spec.profile.seek_offset_seconds as f64)
            .max(0.0);
        let mut parser = ProgressParser::new((duration > 0.0).then_some(duration));
        let tail_limit = self.stderr_tail_lines;

        // The reader task owns the child: it drains stderr (so the encoder
        // never blocks on a full pipe), reaps the process, and reports exit.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            let mut receiver_gone = false;

            while let Ok(Some(line)) = lines.next_line().await {
                let _ = writeln!(log_file, "{line}");
                match parser.parse_line(&line) {
                    Some(update) => {
                        if !receiver_gone
                            && tx.send(EncodeEvent::Progress(update)).await.is_err()
                        {
                            receiver_gone = true;
                        }
                    }
                    None => {
                        if tail.len() == tail_limit {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                }
            }

            match child.wait().await {
                Ok(status) => {
                    let _ = tx
                        .send(EncodeEvent::Exited {
                            success: status.success(),
                            exit_code: status.code(),
                            stderr_tail: tail,
                        })
                        .await;
                }
                Err(e) => {
                    warn!(pid, error = %e, "failed to reap encoder process");
                    let _ = tx
                        .send(EncodeEvent::Exited {
                            success: false,
                            exit_code: None,
                            stderr_tail: tail,
                        })
                        .await;
                }
            }
        });

        Ok(SpawnedEncode { pid, events: rx })
    }
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Default)]
struct FfprobeFormat {
    #[serde(default)]
    format_name: String,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    channels: Option<u32>,
}

fn parse_ffprobe_output(raw: &str) -> Result<MediaDescriptor> {
    let probe: FfprobeOutput = serde_json::from_str(raw)
        .map_err(|e| Error::Unsupported(format!("unsupported source: unreadable probe: {e}")))?;

    let video = probe.streams.iter().find(|s| s.codec_type == "video");
    let audio = probe.streams.iter().find(|s| s.codec_type == "audio");
    let Some(video) = video else {
        return Err(Error::Unsupported(
            "unsupported source: no video stream".to_string(),
        ));
    };

    // ffprobe reports "mov,mp4,m4a,3gp,3g2,mj2" style lists; the first
    // token is the demuxer family name clients know.
    let container = probe
        .format
        .format_name
        .split(',')
        .next()
        .unwrap_or_default()
        .to_string();

    let duration_seconds = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let bitrate_kbps = probe
        .format
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse::<u64>().ok())
        .map_or(0, |bits| bits / 1000);
    let size_bytes = probe
        .format
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(MediaDescriptor {
        container,
        video_codec: video.codec_name.to_ascii_lowercase(),
        audio_codec: audio
            .map(|a| a.codec_name.to_ascii_lowercase())
            .unwrap_or_default(),
        audio_channels: audio.and_then(|a| a.channels).unwrap_or(0),
        duration_seconds,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        bitrate_kbps,
        size_bytes,
    })
}
