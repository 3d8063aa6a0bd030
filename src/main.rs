//! RoomCast - room-based push gateway
//!
//! Accepts framed TCP connections, tracks room membership per connection
//! and forwards PUB requests to HTTP backends.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use roomcast::config::{Config, ConfigError, default_config_path};
use roomcast::dispatcher::Dispatcher;
use roomcast::hub::Hub;
use roomcast::message_log::MemoryMessageLog;
use roomcast::publish::{HttpBackend, PublishRouter};
use roomcast::server::Server;

#[derive(Parser, Debug)]
#[command(name = "roomcast")]
#[command(about = "Room-based push gateway")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Listen address, overrides the config file
    #[arg(long)]
    listen: Option<SocketAddr>,
}

/// Explicit paths must exist; the default path is optional
fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let path = default_config_path();
            if path.exists() {
                Config::load(&path)?
            } else {
                warn!(path = %path.display(), "No config file, using defaults");
                Config::default()
            }
        }
    };

    config.apply_env()?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("RoomCast v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let targets = config.pub_targets()?;
    info!(
        listen = %config.server.listen,
        max_room_num = config.server.max_room_num,
        pub_targets = targets.len(),
        "Starting RoomCast"
    );

    let backend = Arc::new(HttpBackend::new()?);
    let router = Arc::new(PublishRouter::new(targets, backend));
    let hub = Arc::new(Hub::new());
    let log = Arc::new(MemoryMessageLog::new(config.msg_log.capacity));
    let dispatcher = Arc::new(Dispatcher::new(
        hub,
        log,
        router,
        config.server.max_room_num,
    ));

    let server = Server::new(config.server.clone(), dispatcher);
    let listener = match server.bind() {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to start listener");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                error!(error = %e, "Server stopped");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("RoomCast shutdown");
    Ok(())
}
