//! Encoder progress parsing.
//!
//! Consumes the encoder's stderr stats lines
//! (`frame= 120 fps= 25 ... time=00:00:05.00 bitrate=1677.7kbits/s
//! speed=1.25x`) and produces [`ProgressUpdate`] snapshots. Percent and
//! elapsed time never regress within one parser instance.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Instant;

use crate::models::ProgressUpdate;

static FRAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"frame=\s*(\d+)").expect("frame regex"));
static FPS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"fps=\s*([\d.]+)").expect("fps regex"));
static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"L?size=\s*(\d+)\s*(?:kB|KiB)").expect("size regex"));
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("time regex"));
static BITRATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bitrate=\s*([\d.]+)\s*kbits/s").expect("bitrate regex"));
static SPEED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"speed=\s*([\d.]+)x").expect("speed regex"));

/// Stateful stderr parser for one encoder run.
pub struct ProgressParser {
    started_at: Instant,
    /// Output duration the encode is expected to produce, in seconds;
    /// `None` when probing could not determine one
    duration_seconds: Option<f64>,
    last: Option<ProgressUpdate>,
    samples: f64,
}

impl ProgressParser {
    #[must_use]
    pub fn new(duration_seconds: Option<f64>) -> Self {
        Self {
            started_at: Instant::now(),
            duration_seconds,
            last: None,
            samples: 0.0,
        }
    }

    /// Feed one stderr line. Returns a snapshot when the line is a stats
    /// line, `None` otherwise (callers keep non-progress lines for error
    /// reporting).
    pub fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let time_caps = TIME_RE.captures(line)?;
        if !line.contains("frame=") {
            return None;
        }

        let hours: f64 = time_caps[1].parse().ok()?;
        let minutes: f64 = time_caps[2].parse().ok()?;
        let seconds: f64 = time_caps[3].parse().ok()?;
        let out_time = hours * 3600.0 + minutes * 60.0 + seconds;

        let frames = capture_u64(&FRAME_RE, line);
        let fps = capture_f64(&FPS_RE, line);
        let size_kib = capture_u64(&SIZE_RE, line);
        let bitrate_kbps = capture_f64(&BITRATE_RE, line);
        let current_speed = capture_f64(&SPEED_RE, line);

        let mut percent = self
            .duration_seconds
            .filter(|d| *d > 0.0)
            .map_or(0.0, |duration| (out_time / duration * 100.0).clamp(0.0, 100.0));

        let elapsed = self.started_at.elapsed().as_secs_f64();

        self.samples += 1.0;
        let average_speed = self.last.as_ref().map_or(current_speed, |last| {
            last.average_speed + (current_speed - last.average_speed) / self.samples
        });

        if let Some(last) = &self.last {
            // A stale stats line never walks progress backwards.
            percent = percent.max(last.percent_complete);
        }

        let fraction = percent / 100.0;
        let eta_seconds = (fraction > 0.0 && current_speed > 0.0)
            .then(|| elapsed / fraction * (1.0 - fraction));

        let update = ProgressUpdate {
            percent_complete: percent,
            time_elapsed_seconds: elapsed,
            current_speed,
            average_speed,
            bytes_written: size_kib * 1024,
            frames,
            fps,
            bitrate_kbps,
            eta_seconds,
        };
        self.last = Some(update.clone());
        Some(update)
    }

    /// The most recent snapshot, if any stats line has been seen.
    #[must_use]
    pub fn last_update(&self) -> Option<&ProgressUpdate> {
        self.last.as_ref()
    }
}

fn capture_u64(re: &Regex, line: &str) -> u64 {
    re.captures(line)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

fn capture_f64(re: &Regex, line: &str) -> f64 {
    re.captures(line)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0.0)
}
