use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub transcoding: TranscodingConfig,
    pub content_store: ContentStoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Per-request timeout applied to the control API (not segment reads)
    pub request_timeout_seconds: u64,
    /// CORS allowed origins; empty allows any origin
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            request_timeout_seconds: 30,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodingConfig {
    /// Encoder binary; resolved through PATH when not absolute
    pub ffmpeg_path: PathBuf,
    /// Probe binary
    pub ffprobe_path: PathBuf,
    /// Root for per-session working directories and session state
    pub working_dir_root: PathBuf,
    /// Root the media resolver resolves relative media ids against
    pub media_root: PathBuf,
    /// Graceful-terminate window before force kill
    pub graceful_shutdown_seconds: u64,
    /// Window to verify death after force kill
    pub kill_verify_seconds: u64,
    /// Registered processes older than this are killed by the orphan sweep
    pub max_process_age_seconds: u64,
    pub orphan_sweep_interval_seconds: u64,
    /// How long terminal sessions stay visible for client polling
    pub session_ttl_seconds: u64,
    pub session_sweep_interval_seconds: u64,
    /// Segment duration for DASH and HLS output
    pub segment_seconds: u32,
    /// Stderr lines retained on a failed session
    pub stderr_tail_lines: usize,
    /// Hardware acceleration preference order. Software leads by default;
    /// deployments that trust their GPUs can promote hardware entries.
    pub hardware_preference: Vec<String>,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            working_dir_root: PathBuf::from("/var/lib/viewra/transcoding"),
            media_root: PathBuf::from("/var/lib/viewra/media"),
            graceful_shutdown_seconds: 5,
            kill_verify_seconds: 2,
            max_process_age_seconds: 4 * 60 * 60,
            orphan_sweep_interval_seconds: 60,
            session_ttl_seconds: 300,
            session_sweep_interval_seconds: 60,
            segment_seconds: 4,
            stderr_tail_lines: 20,
            hardware_preference: vec![
                "software".to_string(),
                "nvenc".to_string(),
                "vaapi".to_string(),
                "qsv".to_string(),
                "videotoolbox".to_string(),
            ],
        }
    }
}

impl TranscodingConfig {
    #[must_use]
    pub const fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_seconds)
    }

    #[must_use]
    pub const fn kill_verify_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_verify_seconds)
    }

    #[must_use]
    pub const fn max_process_age(&self) -> Duration {
        Duration::from_secs(self.max_process_age_seconds)
    }

    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentStoreConfig {
    /// Content-addressable store root; must share a filesystem with
    /// `transcoding.working_dir_root` so publish stays a rename
    pub root: PathBuf,
    /// TTL for published content
    pub retention_seconds: u64,
    pub expiry_sweep_interval_seconds: u64,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/viewra/content"),
            retention_seconds: 7 * 24 * 60 * 60,
            expiry_sweep_interval_seconds: 300,
        }
    }
}

impl ContentStoreConfig {
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// "json" (production) or "pretty" (development)
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from files and environment.
    ///
    /// Layering: `config/default.toml` -> `config/{RUN_MODE}.toml` ->
    /// `VIEWRA_*` environment variables (`__` section separator, e.g.
    /// `VIEWRA_TRANSCODING__FFMPEG_PATH`).
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = ConfigBuilder::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(Environment::with_prefix("VIEWRA").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Load from an explicit file path plus environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("VIEWRA").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Validate invariants that cannot be expressed in serde defaults.
    pub fn validate(&self) -> crate::Result<()> {
        if self.transcoding.segment_seconds == 0 {
            return Err(crate::Error::Validation(
                "transcoding.segment_seconds must be > 0".to_string(),
            ));
        }
        if self.transcoding.hardware_preference.is_empty() {
            return Err(crate::Error::Validation(
                "transcoding.hardware_preference must not be empty".to_string(),
            ));
        }
        if self.content_store.retention_seconds == 0 {
            return Err(crate::Error::Validation(
                "content_store.retention_seconds must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
