//! End-to-end session lifecycle tests against a scripted provider.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use viewra_core::config::TranscodingConfig;
use viewra_core::models::{
    MediaDescriptor, ProgressUpdate, Session, SessionId, SessionStatus,
};
use viewra_core::provider::{
    EncodeEvent, ProviderRegistry, SpawnSpec, SpawnedEncode, TranscodingProvider,
};
use viewra_core::registry::{ProcessRegistry, RegistryConfig};
use viewra_core::resolver::FsMediaResolver;
use viewra_core::session::{SessionManager, CONTENT_REUSE_PROVIDER};
use viewra_core::store::ContentStore;
use viewra_core::test_helpers::{h264_descriptor, RequestFixture};

/// Fake pids start beyond any plausible real pid so liveness probes see
/// them as dead and signals are no-ops.
static NEXT_FAKE_PID: AtomicU32 = AtomicU32::new(3_000_000);

#[derive(Clone, Copy)]
enum StubBehavior {
    /// Write output files, emit progress, exit successfully after a delay
    Succeed { delay_ms: u64 },
    /// First spawn fails with a hardware error, the retry succeeds
    HardwareFailThenSucceed,
    /// Exit non-zero with a mundane error
    Fail,
    /// Never emit anything until the session is cancelled
    RunForever,
}

struct StubProvider {
    behavior: StubBehavior,
    descriptor: MediaDescriptor,
    spawn_count: AtomicUsize,
    software_spawns: AtomicUsize,
}

impl StubProvider {
    fn new(behavior: StubBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            descriptor: MediaDescriptor {
                duration_seconds: 100.0,
                ..h264_descriptor()
            },
            spawn_count: AtomicUsize::new(0),
            software_spawns: AtomicUsize::new(0),
        })
    }

    fn spawns(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

fn write_output(working_dir: &Path) {
    std::fs::write(working_dir.join("manifest.mpd"), "<MPD type=\"static\"/>")
        .expect("manifest");
    std::fs::write(working_dir.join("init-0.m4s"), b"init").expect("init segment");
    std::fs::write(working_dir.join("chunk-0-00001.m4s"), b"chunk").expect("chunk");
}

fn progress_update(percent: f64) -> ProgressUpdate {
    ProgressUpdate {
        percent_complete: percent,
        time_elapsed_seconds: 1.0,
        current_speed: 1.5,
        average_speed: 1.5,
        bytes_written: 1024,
        frames: 25,
        fps: 25.0,
        bitrate_kbps: 800.0,
        eta_seconds: Some(10.0),
    }
}

#[async_trait]
impl TranscodingProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn probe(&self, _path: &Path) -> viewra_core::Result<MediaDescriptor> {
        Ok(self.descriptor.clone())
    }

    async fn spawn(&self, spec: SpawnSpec) -> viewra_core::Result<SpawnedEncode> {
        let attempt = self.spawn_count.fetch_add(1, Ordering::SeqCst);
        if spec.force_software {
            self.software_spawns.fetch_add(1, Ordering::SeqCst);
        }
        let pid = NEXT_FAKE_PID.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        let behavior = self.behavior;
        let working_dir = spec.working_dir.clone();

        tokio::spawn(async move {
            match behavior {
                StubBehavior::Succeed { delay_ms } => {
                    write_output(&working_dir);
                    let _ = tx.send(EncodeEvent::Progress(progress_update(50.0))).await;
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = tx
                        .send(EncodeEvent::Exited {
                            success: true,
                            exit_code: Some(0),
                            stderr_tail: Vec::new(),
                        })
                        .await;
                }
                StubBehavior::HardwareFailThenSucceed => {
                    if attempt == 0 {
                        let _ = tx
                            .send(EncodeEvent::Exited {
                                success: false,
                                exit_code: Some(1),
                                stderr_tail: vec![
                                    "[h264_nvenc @ 0x55] Cannot load libcuda.so.1".to_string(),
                                ],
                            })
                            .await;
                    } else {
                        write_output(&working_dir);
                        let _ = tx.send(EncodeEvent::Progress(progress_update(80.0))).await;
                        let _ = tx
                            .send(EncodeEvent::Exited {
                                success: true,
                                exit_code: Some(0),
                                stderr_tail: Vec::new(),
                            })
                            .await;
                    }
                }
                StubBehavior::Fail => {
                    let _ = tx
                        .send(EncodeEvent::Exited {
                            success: false,
                            exit_code: Some(1),
                            stderr_tail: vec![
                                "Invalid data found when processing input".to_string(),
                            ],
                        })
                        .await;
                }
                StubBehavior::RunForever => {
                    // Hold the sender open; the session only ends by cancel.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    drop(tx);
                }
            }
        });

        Ok(SpawnedEncode { pid, events: rx })
    }
}

struct TestEnv {
    _dir: TempDir,
    manager: Arc<SessionManager>,
    store: Arc<ContentStore>,
    provider: Arc<StubProvider>,
}

fn test_env(behavior: StubBehavior) -> TestEnv {
    let dir = TempDir::new().expect("tempdir");
    let config = TranscodingConfig {
        working_dir_root: dir.path().join("work"),
        media_root: dir.path().join("media"),
        ..TranscodingConfig::default()
    };
    let store =
        ContentStore::new(dir.path().join("content"), Duration::from_secs(3600)).expect("store");
    let registry = ProcessRegistry::new(RegistryConfig::default());
    let provider = StubProvider::new(behavior);
    let providers = Arc::new(ProviderRegistry::new(provider.clone()));
    let resolver = Arc::new(FsMediaResolver::new(config.media_root.clone()));

    let manager = SessionManager::new(config, store.clone(), registry, providers, resolver)
        .expect("manager");
    TestEnv {
        _dir: dir,
        manager,
        store,
        provider,
    }
}

async fn wait_for_status(
    manager: &SessionManager,
    id: &SessionId,
    status: SessionStatus,
) -> Session {
    for _ in 0..400 {
        let session = manager.get_session(id).expect("session exists");
        if session.status == status {
            return session;
        }
        assert!(
            !(session.status.is_terminal() && session.status != status),
            "session reached terminal state {} while waiting for {status}: {:?}",
            session.status,
            session.error
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("session never reached {status}");
}

#[tokio::test]
async fn successful_encode_publishes_to_content_store() {
    let env = test_env(StubBehavior::Succeed { delay_ms: 50 });
    let request = RequestFixture::new("m42").build();

    let session = env.manager.start(request.clone()).await.expect("start");
    assert_eq!(session.status, SessionStatus::Queued);
    assert!(!session.fingerprint.is_empty());

    let done = wait_for_status(&env.manager, &session.id, SessionStatus::Completed).await;
    assert!(env.store.exists(&done.fingerprint));
    assert!(done.working_dir.is_none(), "working dir ownership moved to store");
    assert!(done.published_path.is_some());
    assert!(done.progress.is_some());
    assert_eq!(
        done.manifest_url(),
        format!("/api/v1/content/{}/manifest.mpd", done.fingerprint)
    );

    let (_, leaf) = env.store.get(&done.fingerprint).expect("published record");
    assert!(leaf.join("manifest.mpd").is_file());
    assert!(leaf.join("chunk-0-00001.m4s").is_file());
}

#[tokio::test]
async fn published_fingerprint_is_reused_without_spawning() {
    let env = test_env(StubBehavior::Succeed { delay_ms: 10 });
    let request = RequestFixture::new("m42").build();

    let first = env.manager.start(request.clone()).await.expect("first start");
    let first = wait_for_status(&env.manager, &first.id, SessionStatus::Completed).await;

    let second = env.manager.start(request.clone()).await.expect("second start");
    assert_eq!(second.status, SessionStatus::Completed);
    assert_eq!(second.provider, CONTENT_REUSE_PROVIDER);
    assert_eq!(second.fingerprint, first.fingerprint);
    assert_eq!(second.manifest_url(), first.manifest_url());
    assert_eq!(env.provider.spawns(), 1, "dedup must not spawn a second encoder");
}

#[tokio::test]
async fn concurrent_identical_requests_share_one_session() {
    let env = test_env(StubBehavior::Succeed { delay_ms: 400 });
    let request = RequestFixture::new("m42").build();

    let first = env.manager.start(request.clone()).await.expect("first start");
    let second = env.manager.start(request.clone()).await.expect("second start");
    assert_eq!(first.id, second.id, "single flight must attach, not fork");

    wait_for_status(&env.manager, &first.id, SessionStatus::Completed).await;
    assert_eq!(env.provider.spawns(), 1);
}

#[tokio::test]
async fn different_parameters_get_different_fingerprints() {
    let env = test_env(StubBehavior::Succeed { delay_ms: 10 });

    let dash = env
        .manager
        .start(RequestFixture::new("m42").build())
        .await
        .expect("dash start");
    let hls = env
        .manager
        .start(
            RequestFixture::new("m42")
                .with_container(viewra_core::models::StreamingContainer::Hls)
                .build(),
        )
        .await
        .expect("hls start");
    assert_ne!(dash.fingerprint, hls.fingerprint);
}

#[tokio::test]
async fn seek_ahead_spawns_sibling_with_distinct_fingerprint() {
    let env = test_env(StubBehavior::Succeed { delay_ms: 400 });
    let base = env
        .manager
        .start(RequestFixture::new("m42").build())
        .await
        .expect("base start");
    wait_for_status(&env.manager, &base.id, SessionStatus::Running).await;

    let sibling = env
        .manager
        .seek_ahead(&base.id, 300)
        .await
        .expect("seek ahead");
    assert_ne!(sibling.id, base.id);
    assert_ne!(sibling.fingerprint, base.fingerprint);
    assert_eq!(sibling.request.profile.seek_offset_seconds, 300);

    // The base session is unaffected by the sibling.
    let base_now = env.manager.get_session(&base.id).expect("base session");
    assert!(!base_now.status.is_terminal() || base_now.status == SessionStatus::Completed);
    assert_eq!(base_now.request.profile.seek_offset_seconds, 0);
}

#[tokio::test]
async fn stop_cancels_and_removes_working_directory() {
    let env = test_env(StubBehavior::RunForever);
    let session = env
        .manager
        .start(RequestFixture::new("m42").build())
        .await
        .expect("start");
    let running = wait_for_status(&env.manager, &session.id, SessionStatus::Running).await;
    let working_dir = running.working_dir.clone().expect("working dir");
    assert!(working_dir.is_dir());

    let stopped = env.manager.stop(&session.id).await.expect("stop");
    assert_eq!(stopped.status, SessionStatus::Cancelled);
    assert!(!working_dir.exists(), "working directory must be removed");
    assert!(!env.store.exists(&stopped.fingerprint));

    // Stopping a terminal session is a no-op.
    let again = env.manager.stop(&session.id).await.expect("stop again");
    assert_eq!(again.status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn stop_all_reports_count() {
    let env = test_env(StubBehavior::RunForever);
    let a = env
        .manager
        .start(RequestFixture::new("m1").build())
        .await
        .expect("start a");
    let b = env
        .manager
        .start(RequestFixture::new("m2").build())
        .await
        .expect("start b");
    wait_for_status(&env.manager, &a.id, SessionStatus::Running).await;
    wait_for_status(&env.manager, &b.id, SessionStatus::Running).await;

    assert_eq!(env.manager.stop_all().await, 2);
    assert!(env
        .manager
        .list_sessions()
        .iter()
        .all(|s| s.status == SessionStatus::Cancelled));
}

#[tokio::test]
async fn hardware_failure_retries_once_with_software() {
    let env = test_env(StubBehavior::HardwareFailThenSucceed);
    let request = RequestFixture::new("m42").with_hwaccel("nvenc").build();

    let session = env.manager.start(request.clone()).await.expect("start");
    let done = wait_for_status(&env.manager, &session.id, SessionStatus::Completed).await;

    assert_eq!(env.provider.spawns(), 2, "exactly two spawn attempts");
    assert_eq!(
        env.provider.software_spawns.load(Ordering::SeqCst),
        1,
        "the retry must force software"
    );
    assert!(env.store.exists(&done.fingerprint));
}

#[tokio::test]
async fn mundane_failure_keeps_error_and_no_content() {
    let env = test_env(StubBehavior::Fail);
    let session = env
        .manager
        .start(RequestFixture::new("m42").build())
        .await
        .expect("start");
    let failed = wait_for_status(&env.manager, &session.id, SessionStatus::Failed).await;

    assert_eq!(env.provider.spawns(), 1, "non-hardware failures never retry");
    let error = failed.error.expect("failed session retains its error");
    assert!(error.contains("Invalid data found"));
    assert!(!env.store.exists(&failed.fingerprint));
}

#[tokio::test]
async fn recovery_fails_interrupted_sessions_and_collects_orphans() {
    let dir = TempDir::new().expect("tempdir");
    let work_root = dir.path().join("work");
    let state_dir = work_root.join("sessions");
    std::fs::create_dir_all(&state_dir).expect("state dir");

    // A session persisted mid-encode by a previous run.
    let request = RequestFixture::new("m42").build();
    let mut interrupted = Session::new("f00dabcd".repeat(8), "stub".to_string(), request);
    interrupted.status = SessionStatus::Running;
    interrupted.pid = Some(3_999_999);
    let stale_workdir = work_root.join(interrupted.id.as_str());
    std::fs::create_dir_all(&stale_workdir).expect("stale workdir");
    interrupted.working_dir = Some(stale_workdir.clone());
    std::fs::write(
        state_dir.join(format!("{}.json", interrupted.id)),
        serde_json::to_vec(&interrupted).expect("serialize"),
    )
    .expect("persist");

    // A working directory with no session state at all.
    let orphan_dir = work_root.join("orphan-session-dir");
    std::fs::create_dir_all(&orphan_dir).expect("orphan dir");

    let config = TranscodingConfig {
        working_dir_root: work_root,
        media_root: dir.path().join("media"),
        ..TranscodingConfig::default()
    };
    let store =
        ContentStore::new(dir.path().join("content"), Duration::from_secs(3600)).expect("store");
    let registry = ProcessRegistry::new(RegistryConfig::default());
    let providers = Arc::new(ProviderRegistry::new(StubProvider::new(StubBehavior::Fail)));
    let resolver = Arc::new(FsMediaResolver::new(config.media_root.clone()));
    let manager =
        SessionManager::new(config, store, registry, providers, resolver).expect("manager");

    manager.recover().await;

    let recovered = manager.get_session(&interrupted.id).expect("recovered session");
    assert_eq!(recovered.status, SessionStatus::Failed);
    assert_eq!(
        recovered.error.as_deref(),
        Some("process not found after restart")
    );
    assert!(!stale_workdir.exists());
    assert!(!orphan_dir.exists(), "orphaned working dirs are collected");
}

#[tokio::test]
async fn progress_snapshots_are_monotonic() {
    let env = test_env(StubBehavior::Succeed { delay_ms: 200 });
    let session = env
        .manager
        .start(RequestFixture::new("m42").build())
        .await
        .expect("start");

    let mut last_percent = 0.0;
    let mut last_elapsed = 0.0;
    for _ in 0..40 {
        if let Ok(Some(progress)) = env.manager.get_progress(&session.id) {
            assert!(progress.percent_complete >= last_percent);
            assert!(progress.time_elapsed_seconds >= last_elapsed);
            last_percent = progress.percent_complete;
            last_elapsed = progress.time_elapsed_seconds;
        }
        let done = env.manager.get_session(&session.id).expect("session");
        if done.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
