//! Provider adapter: the uniform contract between the session manager and
//! encoder back-ends.
//!
//! A provider exposes `name`, `probe` and `spawn`. Spawned processes write
//! their manifest and segments into the given working directory, run in
//! their own process group, and report progress through an event channel
//! until exit. New back-ends register here without touching the session
//! manager.

mod ffmpeg;

pub use ffmpeg::FfmpegProvider;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::models::{EncodingProfile, MediaDescriptor, ProgressUpdate};
use crate::{Error, Result};

/// Everything a provider needs to launch one encode.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub media: MediaDescriptor,
    pub profile: EncodingProfile,
    pub input: PathBuf,
    pub working_dir: PathBuf,
    /// Build the software-fallback vector instead of the requested one
    /// (set for the retry after a hardware failure)
    pub force_software: bool,
}

/// Events emitted by a running encode.
#[derive(Debug, Clone)]
pub enum EncodeEvent {
    Progress(ProgressUpdate),
    Exited {
        success: bool,
        exit_code: Option<i32>,
        /// Last stderr lines, for failure forensics
        stderr_tail: Vec<String>,
    },
}

/// A launched encoder process: its pid plus the event stream. The internal
/// reader task owns the child handle and reaps it on exit; consumers treat
/// an empty channel as "no update yet", not as failure.
#[derive(Debug)]
pub struct SpawnedEncode {
    pub pid: u32,
    pub events: mpsc::Receiver<EncodeEvent>,
}

#[async_trait]
pub trait TranscodingProvider: Send + Sync {
    /// Stable provider name ("ffmpeg", ...)
    fn name(&self) -> &'static str;

    /// Probe a source file into an immutable descriptor.
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor>;

    /// Launch one encode into `spec.working_dir`.
    async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedEncode>;
}

/// Name -> provider lookup.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn TranscodingProvider>>,
    default_name: String,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(default: Arc<dyn TranscodingProvider>) -> Self {
        let default_name = default.name().to_string();
        let mut providers: HashMap<String, Arc<dyn TranscodingProvider>> = HashMap::new();
        providers.insert(default_name.clone(), default);
        Self {
            providers,
            default_name,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn TranscodingProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn TranscodingProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no provider named {name}")))
    }

    pub fn default_provider(&self) -> Result<Arc<dyn TranscodingProvider>> {
        self.get(&self.default_name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}
