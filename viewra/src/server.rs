//! Server lifecycle management
//!
//! Wires the transcoding services together, runs the HTTP server, and
//! drives bounded-deadline shutdown: sessions are cancelled first, then
//! the process registry kills anything still running.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use viewra_api::{build_router, AppState};
use viewra_core::config::TranscodingConfig;
use viewra_core::provider::{FfmpegProvider, ProviderRegistry};
use viewra_core::registry::{ProcessRegistry, RegistryConfig};
use viewra_core::resolver::FsMediaResolver;
use viewra_core::session::SessionManager;
use viewra_core::store::ContentStore;
use viewra_core::Config;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub struct ViewraServer {
    config: Arc<Config>,
    state: AppState,
    registry: Arc<ProcessRegistry>,
}

impl ViewraServer {
    /// Construct all services. Fails fast on unusable roots; a missing
    /// encoder binary is reported but does not prevent startup (content
    /// already in the store remains servable).
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let registry = ProcessRegistry::init_global(RegistryConfig::from(&config.transcoding));
        let store = ContentStore::new(
            &config.content_store.root,
            config.content_store.retention(),
        )?;
        let provider = Arc::new(FfmpegProvider::new(&config.transcoding));
        let providers = Arc::new(ProviderRegistry::new(provider));
        let resolver = Arc::new(FsMediaResolver::new(config.transcoding.media_root.clone()));
        let session_manager = SessionManager::new(
            config.transcoding.clone(),
            store.clone(),
            registry.clone(),
            providers,
            resolver,
        )?;

        let config = Arc::new(config);
        Ok(Self {
            state: AppState {
                config: config.clone(),
                session_manager,
                store,
            },
            config,
            registry,
        })
    }

    /// Serve until SIGINT/SIGTERM, then shut down within the deadline.
    pub async fn run(self) -> anyhow::Result<()> {
        check_encoder(&self.config.transcoding);

        self.state.session_manager.recover().await;

        let registry_sweeper = self.registry.spawn_sweeper();
        let expiry_sweeper = self.state.store.spawn_expiry_sweeper(Duration::from_secs(
            self.config.content_store.expiry_sweep_interval_seconds,
        ));
        let session_sweeper = self.state.session_manager.spawn_session_sweeper();

        let addr = format!(
            "{}:{}",
            self.config.server.host, self.config.server.http_port
        );
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("HTTP server listening on {addr}");

        axum::serve(listener, build_router(self.state.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("shutting down");
        self.state.session_manager.shutdown().await;
        self.state.store.shutdown();
        self.registry.shutdown(SHUTDOWN_DEADLINE).await;

        registry_sweeper.abort();
        expiry_sweeper.abort();
        session_sweeper.abort();
        info!("shutdown complete");
        Ok(())
    }
}

/// The encoder binary going missing is an environment fault, not a crash:
/// the subsystem refuses transcode work but keeps serving published content.
fn check_encoder(config: &TranscodingConfig) {
    match std::process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
    {
        Ok(output) if output.status.success() => {
            info!(path = %config.ffmpeg_path.display(), "encoder binary found");
        }
        _ => {
            error!(
                path = %config.ffmpeg_path.display(),
                "encoder binary missing or unusable; transcode sessions will fail"
            );
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
