mod server;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use viewra_core::{logging, Config};

#[derive(Parser, Debug)]
#[command(name = "viewra", about = "Viewra transcoding & adaptive-streaming server")]
struct Args {
    /// Path to a configuration file (TOML); falls back to the
    /// config/ directory + VIEWRA_* environment layering
    #[arg(short, long, env = "VIEWRA_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;

    // Hold the guard so buffered log output is flushed on shutdown
    let _log_guard = logging::init_logging(&config.logging)?;
    info!("Viewra transcoding server starting...");
    info!(
        "HTTP address: {}:{}",
        config.server.host, config.server.http_port
    );

    server::ViewraServer::build(config)?.run().await
}
