// Control daemon: owns the LEDs and the button, takes commands over a UNIX socket
use std::path::PathBuf;
use std::time::Duration;

use beacon::config;
use beacon::control::{ControlRequest, Controller};
use beacon::server;
use clap::Parser;
use eyre::{eyre, Result, WrapErr};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

#[derive(Parser, Debug)]
#[command(version, about = "GPIO LED and button control daemon")]
struct Args {
    /// Config file, defaults to $XDG_CONFIG_HOME/beacon/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Overrides the socket path from the config file
    #[arg(short, long)]
    socket: Option<PathBuf>,
    /// trace, debug, info, warn or error
    #[arg(short, long)]
    log_level: Option<String>,
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = config::load_config(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.socket.path = socket;
    }
    let level: tracing::Level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.log_level)
        .parse()
        .map_err(|e| eyre!("invalid log level: {}", e))?;
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber).wrap_err("setting default subscriber failed")?;
    info!("Starting beacon version {}", GIT_VERSION);
    info!("GPIO backend: {:?}", config.gpio.backend);

    let controller = Controller::from_config(&config, config.pins())
        .await
        .wrap_err("configuring GPIO")?;
    let listener = server::bind(&config.socket.path)?;
    let (send_to_controller, recv_from_server) = tokio::sync::mpsc::channel::<ControlRequest>(100);
    tokio::spawn(async move {
        if let Err(e) = server::serve(listener, send_to_controller).await {
            error!("Socket server stopped: {:#}", e);
        }
    });

    let poll = config
        .sensor
        .as_ref()
        .map_or(Duration::from_millis(100), |s| Duration::from_millis(s.poll_ms));
    let released = controller.serve(recv_from_server, poll, shutdown_signal()).await;

    if let Err(e) = std::fs::remove_file(&config.socket.path) {
        warn!("Could not remove {}: {}", config.socket.path.display(), e);
    }
    released.wrap_err("releasing GPIO")?;
    info!("Bye");
    Ok(())
}
