//! Process registry: global pid/session/provider tracking, signal
//! escalation and orphan reaping.
//!
//! The registry holds weak references only (pids, never child handles);
//! each session's supervision task owns its process handle. All index
//! mutation happens under one mutex, and nothing is called into other
//! subsystems while it is held.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TranscodingConfig;
use crate::models::SessionId;
use crate::{Error, Result};

const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One registry row.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: u32,
    pub session_id: SessionId,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    /// Process-group id, recorded at registration when the OS supports one
    /// and the child runs in its own group
    pub pgid: Option<i32>,
}

#[derive(Default)]
struct Indices {
    by_pid: HashMap<u32, ProcessEntry>,
    by_session: HashMap<SessionId, HashSet<u32>>,
    by_provider: HashMap<String, HashSet<u32>>,
}

/// Timing knobs for signal escalation and sweeping.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub graceful_timeout: Duration,
    pub kill_verify_timeout: Duration,
    pub max_process_age: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            kill_verify_timeout: Duration::from_secs(2),
            max_process_age: Duration::from_secs(4 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&TranscodingConfig> for RegistryConfig {
    fn from(cfg: &TranscodingConfig) -> Self {
        Self {
            graceful_timeout: cfg.graceful_shutdown_timeout(),
            kill_verify_timeout: cfg.kill_verify_timeout(),
            max_process_age: cfg.max_process_age(),
            sweep_interval: Duration::from_secs(cfg.orphan_sweep_interval_seconds),
        }
    }
}

/// Process-wide encoder process tracking.
pub struct ProcessRegistry {
    indices: Mutex<Indices>,
    config: RegistryConfig,
    shutdown: CancellationToken,
}

static GLOBAL: OnceCell<Arc<ProcessRegistry>> = OnceCell::new();

impl ProcessRegistry {
    /// Create a private instance. Tests and embedded uses construct their
    /// own; the server process uses [`ProcessRegistry::init_global`].
    #[must_use]
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            indices: Mutex::new(Indices::default()),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Install the process-wide singleton. Returns the existing instance if
    /// one was already installed.
    pub fn init_global(config: RegistryConfig) -> Arc<Self> {
        GLOBAL.get_or_init(|| Self::new(config)).clone()
    }

    /// The process-wide singleton, if installed.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    /// Track a spawned encoder process. Fails if the pid is already present.
    pub fn register(&self, pid: u32, session_id: SessionId, provider: &str) -> Result<()> {
        let pgid = own_process_group_of(pid);
        let mut indices = self.indices.lock();
        if indices.by_pid.contains_key(&pid) {
            return Err(Error::Conflict(format!("pid {pid} already registered")));
        }
        let entry = ProcessEntry {
            pid,
            session_id: session_id.clone(),
            provider: provider.to_string(),
            started_at: Utc::now(),
            pgid,
        };
        indices.by_pid.insert(pid, entry);
        indices
            .by_session
            .entry(session_id)
            .or_default()
            .insert(pid);
        indices
            .by_provider
            .entry(provider.to_string())
            .or_default()
            .insert(pid);
        Ok(())
    }

    /// Remove a pid from all indices. Idempotent.
    pub fn unregister(&self, pid: u32) {
        let mut indices = self.indices.lock();
        let Some(entry) = indices.by_pid.remove(&pid) else {
            return;
        };
        if let Some(pids) = indices.by_session.get_mut(&entry.session_id) {
            pids.remove(&pid);
            if pids.is_empty() {
                indices.by_session.remove(&entry.session_id);
            }
        }
        if let Some(pids) = indices.by_provider.get_mut(&entry.provider) {
            pids.remove(&pid);
            if pids.is_empty() {
                indices.by_provider.remove(&entry.provider);
            }
        }
    }

    /// Snapshot of a registry row.
    pub fn get(&self, pid: u32) -> Option<ProcessEntry> {
        self.indices.lock().by_pid.get(&pid).cloned()
    }

    /// Pids registered for a session.
    pub fn pids_for_session(&self, session_id: &SessionId) -> Vec<u32> {
        self.indices
            .lock()
            .by_session
            .get(session_id)
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of tracked processes.
    pub fn len(&self) -> usize {
        self.indices.lock().by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.lock().by_pid.is_empty()
    }

    /// Kill one process with signal escalation: graceful terminate to the
    /// group (or pid), poll liveness every 100 ms for the grace window,
    /// force-kill, then verify death. Errors only if the process refuses
    /// to die.
    pub async fn kill_process(&self, pid: u32) -> Result<()> {
        let pgid = self.indices.lock().by_pid.get(&pid).and_then(|e| e.pgid);

        if !process_alive(pid) {
            self.unregister(pid);
            return Ok(());
        }

        send_terminate(pid, pgid);
        if self
            .wait_for_death(pid, self.config.graceful_timeout)
            .await
        {
            debug!(pid, "process exited after graceful terminate");
            self.unregister(pid);
            return Ok(());
        }

        warn!(pid, "process survived grace window, force killing");
        send_force_kill(pid, pgid);
        if self
            .wait_for_death(pid, self.config.kill_verify_timeout)
            .await
        {
            self.unregister(pid);
            return Ok(());
        }

        Err(Error::Transient(format!("process {pid} refused to die")))
    }

    async fn wait_for_death(&self, pid: u32, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if !process_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(LIVENESS_POLL_INTERVAL).await;
        }
    }

    /// Kill every process registered for a session. Returns how many pids
    /// were signalled.
    pub async fn stop_session(&self, session_id: &SessionId) -> Result<usize> {
        let pids = self.pids_for_session(session_id);
        let count = pids.len();
        for pid in pids {
            if let Err(e) = self.kill_process(pid).await {
                warn!(pid, session_id = %session_id, error = %e, "failed to kill session process");
            }
        }
        Ok(count)
    }

    /// Periodic sweep: unregister pids whose OS process is gone, kill live
    /// pids older than `max_process_age` (runaway jobs from crashed
    /// controllers). Signal failures are logged, never abort the sweep.
    pub async fn cleanup_orphaned(&self) {
        let snapshot: Vec<(u32, DateTime<Utc>)> = self
            .indices
            .lock()
            .by_pid
            .values()
            .map(|e| (e.pid, e.started_at))
            .collect();

        let max_age = chrono::Duration::from_std(self.config.max_process_age)
            .unwrap_or_else(|_| chrono::Duration::hours(4));
        let now = Utc::now();

        for (pid, started_at) in snapshot {
            if !process_alive(pid) {
                debug!(pid, "reaping registry entry for dead process");
                self.unregister(pid);
            } else if now - started_at > max_age {
                warn!(pid, "killing over-age process");
                if let Err(e) = self.kill_process(pid).await {
                    warn!(pid, error = %e, "over-age process refused to die");
                }
            }
        }
    }

    /// Spawn the background orphan sweeper. Stops on [`Self::shutdown`].
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = registry.shutdown.cancelled() => break,
                    _ = ticker.tick() => registry.cleanup_orphaned().await,
                }
            }
        })
    }

    /// Stop the sweeper and kill every tracked process, observing the
    /// deadline. Anything still alive at the deadline gets a final
    /// force-kill.
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutdown.cancel();

        let pids: Vec<u32> = self.indices.lock().by_pid.keys().copied().collect();
        if pids.is_empty() {
            return;
        }
        info!(count = pids.len(), "killing tracked encoder processes");

        let kill_all = async {
            for pid in &pids {
                if let Err(e) = self.kill_process(*pid).await {
                    warn!(pid, error = %e, "process refused to die during shutdown");
                }
            }
        };
        if tokio::time::timeout(deadline, kill_all).await.is_err() {
            for pid in pids {
                if process_alive(pid) {
                    let pgid = self.indices.lock().by_pid.get(&pid).and_then(|e| e.pgid);
                    send_force_kill(pid, pgid);
                }
                self.unregister(pid);
            }
        }
    }
}

/// Liveness probe via the null signal.
#[cfg(unix)]
#[allow(unsafe_code)]
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but is not ours to signal.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
#[must_use]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// The pid's process group, unless it shares ours. A shared group is never
/// recorded: group-signalling it would take the server down with the child.
#[cfg(unix)]
#[allow(unsafe_code)]
fn own_process_group_of(pid: u32) -> Option<i32> {
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid < 0 {
        return None;
    }
    let ours = unsafe { libc::getpgid(0) };
    (pgid != ours).then_some(pgid)
}

#[cfg(not(unix))]
fn own_process_group_of(_pid: u32) -> Option<i32> {
    None
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_signal(pid: u32, signal: libc::c_int) {
    // Signals to already-gone pids are no-ops; nothing to do on failure.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        debug!(
            pid,
            signal,
            error = %std::io::Error::last_os_error(),
            "signal delivery failed"
        );
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_group_signal(pgid: i32, signal: libc::c_int) {
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        debug!(
            pgid,
            signal,
            error = %std::io::Error::last_os_error(),
            "group signal delivery failed"
        );
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32, pgid: Option<i32>) {
    match pgid {
        Some(pgid) => send_group_signal(pgid, libc::SIGTERM),
        None => send_signal(pid, libc::SIGTERM),
    }
}

#[cfg(unix)]
fn send_force_kill(pid: u32, pgid: Option<i32>) {
    if let Some(pgid) = pgid {
        send_group_signal(pgid, libc::SIGKILL);
    }
    send_signal(pid, libc::SIGKILL);
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32, _pgid: Option<i32>) {}

#[cfg(not(unix))]
fn send_force_kill(_pid: u32, _pgid: Option<i32>) {}
