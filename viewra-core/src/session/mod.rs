//! Session lifecycle management.
//!
//! Owns the session state machine, deduplication against the content
//! store, single-flight for concurrent identical requests, encoder
//! supervision with hardware fallback, the atomic publish step, TTL
//! sweeping of terminal sessions, and crash recovery from persisted
//! session state.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TranscodingConfig;
use crate::decision::{abr_ladder_for, DecisionEngine};
use crate::encoder::is_hardware_error;
use crate::models::{
    DeviceProfile, MediaDescriptor, MediaId, PlaybackDecision, ProgressUpdate, Resolution, Session,
    SessionId, SessionStatus, TranscodeRequest,
};
use crate::provider::{EncodeEvent, ProviderRegistry, SpawnSpec, TranscodingProvider};
use crate::registry::{process_alive, ProcessRegistry};
use crate::resolver::MediaResolver;
use crate::store::ContentStore;
use crate::{Error, Result};

/// Provider name reported for dedup hits served from the content store.
pub const CONTENT_REUSE_PROVIDER: &str = "content-reuse";

const SESSION_STATE_DIR: &str = "sessions";

enum EncodeOutcome {
    Cancelled,
    Exited {
        success: bool,
        exit_code: Option<i32>,
        stderr_tail: Vec<String>,
    },
    ChannelClosed,
}

pub struct SessionManager {
    config: TranscodingConfig,
    store: Arc<ContentStore>,
    registry: Arc<ProcessRegistry>,
    providers: Arc<ProviderRegistry>,
    resolver: Arc<dyn MediaResolver>,
    engine: DecisionEngine,
    sessions: DashMap<SessionId, Session>,
    /// fingerprint -> in-flight session, the single-flight index
    inflight: DashMap<String, SessionId>,
    cancel_tokens: DashMap<SessionId, CancellationToken>,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Construct a manager. Creates the working-directory root and the
    /// session state directory; call [`Self::recover`] afterwards to
    /// resolve sessions persisted by a previous run.
    pub fn new(
        config: TranscodingConfig,
        store: Arc<ContentStore>,
        registry: Arc<ProcessRegistry>,
        providers: Arc<ProviderRegistry>,
        resolver: Arc<dyn MediaResolver>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.working_dir_root).map_err(|e| {
            Error::Fatal(format!(
                "working dir root {} not writable: {e}",
                config.working_dir_root.display()
            ))
        })?;
        let state_dir = config.working_dir_root.join(SESSION_STATE_DIR);
        std::fs::create_dir_all(&state_dir)?;

        Ok(Arc::new(Self {
            config,
            store,
            registry,
            providers,
            resolver,
            engine: DecisionEngine::new(),
            sessions: DashMap::new(),
            inflight: DashMap::new(),
            cancel_tokens: DashMap::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Probe a source and decide direct play / remux / transcode.
    pub async fn decide(
        &self,
        media_ref: &str,
        device: &DeviceProfile,
    ) -> Result<PlaybackDecision> {
        let path = self.resolve_source(media_ref)?;
        let provider = self.providers.default_provider()?;
        let media = provider.probe(&path).await?;
        self.engine.decide(&media, device)
    }

    /// The profile the engine would pick for this media/device pair.
    pub async fn recommended_transcode_params(
        &self,
        media_ref: &str,
        device: &DeviceProfile,
        enable_abr: bool,
    ) -> Result<crate::models::EncodingProfile> {
        let path = self.resolve_source(media_ref)?;
        let provider = self.providers.default_provider()?;
        let media = provider.probe(&path).await?;
        Ok(self
            .engine
            .recommended_transcode_params(&media, device, enable_abr))
    }

    /// Start (or attach to) a transcode for the request.
    ///
    /// Dedup ladder: an already-published fingerprint yields an immediately
    /// completed session backed by the existing record; an in-flight
    /// session with the same fingerprint is returned as-is (no second
    /// encoder); otherwise a fresh session is created and supervised.
    pub async fn start(self: &Arc<Self>, mut request: TranscodeRequest) -> Result<Session> {
        let provider = match &request.provider {
            Some(name) => self.providers.get(name)?,
            None => self.providers.default_provider()?,
        };
        let media = provider.probe(&request.media_path).await?;

        if request.profile.enable_abr && request.profile.abr_ladder.is_empty() {
            let source = Resolution::new(media.width, media.height);
            let cap = request
                .profile
                .target_bitrate_kbps
                .or((media.bitrate_kbps > 0).then_some(media.bitrate_kbps));
            request.profile.abr_ladder = abr_ladder_for(source, cap);
        }
        if request.formats.is_empty() {
            request.formats = vec![request.profile.container.as_str().to_string()];
        }

        let fingerprint =
            ContentStore::generate_content_hash(&request.media_id, &request.profile, &request.formats);

        if self.store.exists(&fingerprint) {
            return self.reuse_content(fingerprint, request);
        }

        let session = match self.inflight.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = self
                    .sessions
                    .get(occupied.get())
                    .map(|s| s.value().clone());
                match existing {
                    Some(session) if !session.status.is_terminal() => {
                        debug!(
                            session_id = %session.id,
                            fingerprint = %fingerprint,
                            "attaching caller to in-flight session"
                        );
                        return Ok(session);
                    }
                    _ => {
                        // Stale index entry from a session that died without
                        // cleaning up after itself.
                        let session = self.create_session(fingerprint.clone(), &request, &provider)?;
                        occupied.insert(session.id.clone());
                        session
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let session = self.create_session(fingerprint.clone(), &request, &provider)?;
                vacant.insert(session.id.clone());
                session
            }
        };

        let token = CancellationToken::new();
        self.cancel_tokens.insert(session.id.clone(), token.clone());

        let manager = Arc::clone(self);
        let session_id = session.id.clone();
        tokio::spawn(async move {
            manager.run_session(session_id, provider, media, token).await;
        });

        Ok(session)
    }

    /// Snapshot read of one session.
    pub fn get_session(&self, id: &SessionId) -> Result<Session> {
        self.sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::NotFound(format!("session {id} not found")))
    }

    /// Latest progress snapshot for a session.
    pub fn get_progress(&self, id: &SessionId) -> Result<Option<ProgressUpdate>> {
        Ok(self.get_session(id)?.progress)
    }

    /// All sessions currently held in the index.
    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Cancel a session: the encoder is killed (graceful then forceful),
    /// the working directory removed, the state moved to `cancelled`. The
    /// content store is never touched. Idempotent for terminal sessions.
    pub async fn stop(&self, id: &SessionId) -> Result<Session> {
        let session = self.get_session(id)?;
        if session.status.is_terminal() {
            return Ok(session);
        }

        if let Some(token) = self.cancel_tokens.get(id) {
            token.cancel();
        }
        self.registry.stop_session(id).await?;
        self.transition(id, SessionStatus::Cancelled, None);
        self.cleanup_working_dir(id);
        self.get_session(id)
    }

    /// Cancel every non-terminal session. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let active: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| !s.value().status.is_terminal())
            .map(|s| s.key().clone())
            .collect();
        let mut stopped = 0;
        for id in active {
            match self.stop(&id).await {
                Ok(_) => stopped += 1,
                Err(e) => warn!(session_id = %id, error = %e, "failed to stop session"),
            }
        }
        stopped
    }

    /// Create a sibling session encoding from `position_seconds` onward.
    /// The seek offset canonicalises into the fingerprint, so the sibling
    /// gets its own content identity and its output benefits future
    /// callers at that offset.
    pub async fn seek_ahead(
        self: &Arc<Self>,
        base_session_id: &SessionId,
        position_seconds: u64,
    ) -> Result<Session> {
        let base = self.get_session(base_session_id)?;
        let mut request = base.request.clone();
        request.profile.seek_offset_seconds = position_seconds;
        self.start(request).await
    }

    /// Resolve a caller-supplied media reference: an absolute path is used
    /// directly, anything else goes through the media resolver.
    pub fn resolve_source(&self, media_ref: &str) -> Result<PathBuf> {
        let direct = Path::new(media_ref);
        if direct.is_absolute() {
            return if direct.is_file() {
                Ok(direct.to_path_buf())
            } else {
                Err(Error::NotFound(format!("media file {media_ref} not found")))
            };
        }
        self.resolver.resolve(&MediaId::from(media_ref))
    }

    /// Restore state persisted by a previous run. Non-terminal sessions
    /// are marked failed (their encoder cannot be re-attached across a
    /// restart); stray pids they recorded are killed; working directories
    /// without a session are garbage-collected.
    pub async fn recover(&self) {
        let state_dir = self.state_dir();
        let Ok(entries) = std::fs::read_dir(&state_dir) else {
            return;
        };

        for entry in entries.flatten() {
            if entry.path().extension().is_none_or(|e| e != "json") {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(mut session) = serde_json::from_str::<Session>(&raw) else {
                warn!(path = %entry.path().display(), "dropping unreadable session state");
                let _ = std::fs::remove_file(entry.path());
                continue;
            };

            if session.status.is_terminal() {
                let expired = Utc::now() - session.ended_at.unwrap_or(session.created_at)
                    > chrono::Duration::from_std(self.config.session_ttl())
                        .unwrap_or_else(|_| chrono::Duration::minutes(5));
                if expired {
                    let _ = std::fs::remove_file(entry.path());
                } else {
                    self.sessions.insert(session.id.clone(), session);
                }
                continue;
            }

            if let Some(pid) = session.pid {
                if process_alive(pid) {
                    warn!(pid, session_id = %session.id, "killing stray encoder from previous run");
                    let _ = self.registry.kill_process(pid).await;
                }
            }
            info!(session_id = %session.id, "marking interrupted session failed");
            session.status = SessionStatus::Failed;
            session.error = Some("process not found after restart".to_string());
            session.ended_at = Some(Utc::now());
            if let Some(dir) = session.working_dir.take() {
                let _ = std::fs::remove_dir_all(dir);
            }
            self.persist(&session);
            self.sessions.insert(session.id.clone(), session);
        }

        self.collect_orphaned_working_dirs();
    }

    /// Remove terminal sessions past their TTL from the index and from
    /// disk. The content they produced stays in the content store.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.session_ttl())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| {
                s.value().status.is_terminal()
                    && now - s.value().ended_at.unwrap_or(s.value().created_at) > ttl
            })
            .map(|s| s.key().clone())
            .collect();

        for id in &expired {
            self.sessions.remove(id);
            let _ = std::fs::remove_file(self.persist_path(id));
            debug!(session_id = %id, "expired terminal session removed");
        }
        expired.len()
    }

    /// Spawn the background TTL sweeper. Stops on [`Self::shutdown`].
    pub fn spawn_session_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.session_sweep_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.cleanup_expired_sessions();
                    }
                }
            }
        })
    }

    /// Stop sweepers and cancel every active session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let stopped = self.stop_all().await;
        if stopped > 0 {
            info!(stopped, "cancelled active sessions during shutdown");
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn reuse_content(&self, fingerprint: String, request: TranscodeRequest) -> Result<Session> {
        let (_, leaf) = self.store.get(&fingerprint)?;
        let mut session = Session::new(fingerprint, CONTENT_REUSE_PROVIDER.to_string(), request);
        session.status = SessionStatus::Completed;
        session.ended_at = Some(Utc::now());
        session.published_path = Some(leaf);
        info!(session_id = %session.id, fingerprint = %session.fingerprint, "serving existing content");
        self.persist(&session);
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    fn create_session(
        &self,
        fingerprint: String,
        request: &TranscodeRequest,
        provider: &Arc<dyn TranscodingProvider>,
    ) -> Result<Session> {
        let mut session = Session::new(
            fingerprint,
            provider.name().to_string(),
            request.clone(),
        );
        let working_dir = self.config.working_dir_root.join(session.id.as_str());
        std::fs::create_dir_all(&working_dir)?;
        session.working_dir = Some(working_dir);
        info!(
            session_id = %session.id,
            fingerprint = %session.fingerprint,
            provider = %session.provider,
            "session created"
        );
        self.persist(&session);
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn run_session(
        self: Arc<Self>,
        id: SessionId,
        provider: Arc<dyn TranscodingProvider>,
        media: MediaDescriptor,
        token: CancellationToken,
    ) {
        self.transition(&id, SessionStatus::Starting, None);

        let Ok(session) = self.get_session(&id) else {
            return;
        };
        if session.status.is_terminal() {
            // A stop arrived before supervision began.
            return;
        }
        let request = session.request;
        let Some(working_dir) = session.working_dir else {
            self.transition(
                &id,
                SessionStatus::Failed,
                Some("session has no working directory".to_string()),
            );
            return;
        };
        let fingerprint = session.fingerprint;

        let mut attempt = 0u32;
        loop {
            if token.is_cancelled() {
                self.transition(&id, SessionStatus::Cancelled, None);
                self.cleanup_working_dir(&id);
                break;
            }
            attempt += 1;
            let force_software = attempt > 1;
            if force_software {
                info!(session_id = %id, "retrying with software fallback");
            }

            let spec = SpawnSpec {
                media: media.clone(),
                profile: request.profile.clone(),
                input: request.media_path.clone(),
                working_dir: working_dir.clone(),
                force_software,
            };

            let mut spawned = match provider.spawn(spec).await {
                Ok(spawned) => spawned,
                Err(e) => {
                    if attempt == 1 && is_hardware_error(&e.to_string()) {
                        warn!(session_id = %id, error = %e, "hardware launch failed");
                        continue;
                    }
                    self.transition(&id, SessionStatus::Failed, Some(e.to_string()));
                    self.cleanup_working_dir(&id);
                    break;
                }
            };

            if let Err(e) = self.registry.register(spawned.pid, id.clone(), provider.name()) {
                warn!(session_id = %id, pid = spawned.pid, error = %e, "pid registration failed");
            }
            if let Some(mut entry) = self.sessions.get_mut(&id) {
                entry.pid = Some(spawned.pid);
            }
            self.transition(&id, SessionStatus::Running, None);

            let outcome = loop {
                tokio::select! {
                    () = token.cancelled() => break EncodeOutcome::Cancelled,
                    event = spawned.events.recv() => match event {
                        Some(EncodeEvent::Progress(update)) => self.update_progress(&id, update),
                        Some(EncodeEvent::Exited { success, exit_code, stderr_tail }) => {
                            break EncodeOutcome::Exited { success, exit_code, stderr_tail };
                        }
                        None => break EncodeOutcome::ChannelClosed,
                    }
                }
            };

            self.registry.unregister(spawned.pid);
            if let Some(mut entry) = self.sessions.get_mut(&id) {
                entry.pid = None;
            }

            match outcome {
                EncodeOutcome::Cancelled => {
                    // stop() drives the kill; make sure the pid is gone even
                    // when the token was cancelled some other way.
                    let _ = self.registry.kill_process(spawned.pid).await;
                    self.transition(&id, SessionStatus::Cancelled, None);
                    self.cleanup_working_dir(&id);
                    break;
                }
                EncodeOutcome::Exited { success: true, .. } => {
                    self.publish(&id, &fingerprint, &request, &working_dir).await;
                    break;
                }
                EncodeOutcome::Exited {
                    success: false,
                    exit_code,
                    stderr_tail,
                } => {
                    let tail = stderr_tail.join("\n");
                    if attempt == 1 && is_hardware_error(&tail) {
                        warn!(session_id = %id, "encoder failed with hardware error");
                        continue;
                    }
                    let error = format!(
                        "encoder exited with code {}: {tail}",
                        exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                    );
                    self.transition(&id, SessionStatus::Failed, Some(error));
                    self.cleanup_working_dir(&id);
                    break;
                }
                EncodeOutcome::ChannelClosed => {
                    self.transition(
                        &id,
                        SessionStatus::Failed,
                        Some("encoder event stream closed unexpectedly".to_string()),
                    );
                    self.cleanup_working_dir(&id);
                    break;
                }
            }
        }

        self.inflight
            .remove_if(&fingerprint, |_, session_id| session_id == &id);
        self.cancel_tokens.remove(&id);
    }

    async fn publish(
        &self,
        id: &SessionId,
        fingerprint: &str,
        request: &TranscodeRequest,
        working_dir: &Path,
    ) {
        self.transition(id, SessionStatus::Publishing, None);

        let manifest = request.profile.container.manifest_filename();
        if let Err(e) = validate_output(working_dir, manifest) {
            self.transition(id, SessionStatus::Failed, Some(e.to_string()));
            self.cleanup_working_dir(id);
            return;
        }

        // The encoder log is forensic state, not content; keep it next to
        // the session state instead of publishing it.
        let log = working_dir.join("encoder.log");
        if log.is_file() {
            let _ = std::fs::rename(&log, self.state_dir().join(format!("{id}.encoder.log")));
        }

        match self
            .store
            .store(
                fingerprint,
                working_dir,
                &request.media_id,
                vec![manifest.to_string()],
            )
            .await
        {
            Ok(_) => {
                let leaf = self.store.leaf_path(fingerprint).ok();
                if let Some(mut entry) = self.sessions.get_mut(id) {
                    entry.published_path = leaf;
                    entry.working_dir = None;
                }
                self.transition(id, SessionStatus::Completed, None);
            }
            Err(e) => {
                // A pre-existing record was already handled as success by
                // the store; anything else is a real publish failure.
                self.transition(id, SessionStatus::Failed, Some(format!("publish failed: {e}")));
                self.cleanup_working_dir(id);
            }
        }
    }

    fn update_progress(&self, id: &SessionId, update: ProgressUpdate) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.progress = Some(update);
            entry.last_accessed_at = Utc::now();
        }
    }

    /// Apply a state transition if the state machine permits it; invalid
    /// transitions are dropped (the session may already be terminal from a
    /// concurrent stop).
    fn transition(&self, id: &SessionId, next: SessionStatus, error: Option<String>) {
        let Some(mut entry) = self.sessions.get_mut(id) else {
            return;
        };
        let current = entry.status;
        if !current.can_transition_to(next) {
            if current != next {
                debug!(session_id = %id, %current, %next, "transition not permitted, ignoring");
            }
            return;
        }
        entry.status = next;
        entry.last_accessed_at = Utc::now();
        if let Some(error) = error {
            entry.error = Some(error);
        }
        if next.is_terminal() {
            entry.ended_at = Some(Utc::now());
        }
        info!(session_id = %id, from = %current, to = %next, "session state changed");
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot);
    }

    fn cleanup_working_dir(&self, id: &SessionId) {
        let Some(mut entry) = self.sessions.get_mut(id) else {
            return;
        };
        if let Some(dir) = entry.working_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if dir.exists() {
                    warn!(session_id = %id, error = %e, "failed to remove working directory");
                }
            }
        }
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot);
    }

    fn collect_orphaned_working_dirs(&self) {
        let Ok(entries) = std::fs::read_dir(&self.config.working_dir_root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == SESSION_STATE_DIR {
                continue;
            }
            let id = SessionId::from_string(name);
            let known = self.sessions.contains_key(&id) || self.persist_path(&id).is_file();
            if !known {
                info!(dir = %path.display(), "removing orphaned working directory");
                let _ = std::fs::remove_dir_all(&path);
            }
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.config.working_dir_root.join(SESSION_STATE_DIR)
    }

    fn persist_path(&self, id: &SessionId) -> PathBuf {
        self.state_dir().join(format!("{id}.json"))
    }

    /// Persist a session snapshot (atomic write). Persistence failures are
    /// logged, never fatal to the session itself.
    fn persist(&self, session: &Session) {
        let path = self.persist_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        let result = serde_json::to_vec_pretty(session)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(&tmp, bytes))
            .and_then(|()| std::fs::rename(&tmp, &path));
        if let Err(e) = result {
            warn!(session_id = %session.id, error = %e, "failed to persist session state");
        }
    }
}

/// A successful encode must leave the manifest plus at least one segment.
fn validate_output(working_dir: &Path, manifest: &str) -> Result<()> {
    if !working_dir.join(manifest).is_file() {
        return Err(Error::Transient(format!(
            "encoder produced no {manifest}"
        )));
    }
    // For single-file mp4 output the manifest is the output itself.
    if manifest.ends_with(".mp4") {
        return Ok(());
    }
    let has_segment = std::fs::read_dir(working_dir)
        .map(|entries| {
            entries.flatten().any(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name != manifest && name != "encoder.log" && entry.path().is_file()
            })
        })
        .unwrap_or(false);
    if !has_segment {
        return Err(Error::Transient("encoder produced no segments".to_string()));
    }
    Ok(())
}
