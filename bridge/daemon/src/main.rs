//! Hostbridge Daemon - Socket Services for a Sandbox
//!
//! Hosts the audio and shared-memory socket services and the guest command
//! channel for one runtime root, until told to stop.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! hostbridge-daemon
//!
//! # Custom runtime root and guest agent
//! hostbridge-daemon --root-dir /run/sandbox --guest-host 10.0.2.15
//!
//! # Run a program in the guest once connected
//! hostbridge-daemon --exec "/usr/bin/app --fullscreen"
//!
//! # Play audio through a pipe read by a native player
//! mkfifo /tmp/hb.pcm && pw-cat --playback --raw /tmp/hb.pcm &
//! hostbridge-daemon --audio-backend file --audio-output /tmp/hb.pcm
//!
//! # Verbose logging
//! RUST_LOG=debug hostbridge-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod pidfile;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use hostbridge_core::{
    default_config_path, load_config_from_path, BackendKind, BridgeConfig, ConfigOverrides,
    Environment, GuestChannel,
};

/// Hostbridge Daemon - native IPC services for sandboxed programs
#[derive(Parser, Debug)]
#[command(name = "hostbridge-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "HOSTBRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the service sockets and PID file
    #[arg(short = 'r', long, value_name = "DIR")]
    root_dir: Option<PathBuf>,

    /// Guest agent host
    #[arg(long, value_name = "HOST")]
    guest_host: Option<String>,

    /// Guest agent port
    #[arg(long, value_name = "PORT")]
    guest_port: Option<u16>,

    /// Do not serve audio
    #[arg(long)]
    no_audio: bool,

    /// Playback backend (null, file)
    #[arg(long, value_name = "KIND")]
    audio_backend: Option<BackendKind>,

    /// Output file or named pipe for the file backend
    #[arg(long, value_name = "PATH")]
    audio_output: Option<PathBuf>,

    /// Do not serve shared memory
    #[arg(long)]
    no_shm: bool,

    /// Do not connect to the guest agent
    #[arg(long)]
    no_guest: bool,

    /// Command line to run in the guest (repeatable)
    #[arg(short = 'e', long = "exec", value_name = "COMMAND")]
    exec: Vec<String>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "HOSTBRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref root) = self.root_dir {
            overrides = overrides.with_root_dir(root.clone());
        }
        if let Some(ref host) = self.guest_host {
            overrides = overrides.with_guest_host(host.clone());
        }
        if let Some(port) = self.guest_port {
            overrides = overrides.with_guest_port(port);
        }
        if self.no_audio {
            overrides = overrides.with_audio_enabled(false);
        }
        if let Some(backend) = self.audio_backend {
            overrides = overrides.with_audio_backend(backend);
        }
        if let Some(ref output) = self.audio_output {
            overrides = overrides.with_audio_output(output.clone());
        }
        if self.no_shm {
            overrides = overrides.with_shm_enabled(false);
        }
        if self.no_guest {
            overrides = overrides.with_guest_enabled(false);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "hostbridge_daemon={level},hostbridge_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .init();
}

/// Load configuration and apply command-line overrides
fn resolve_config(args: &Args) -> Result<BridgeConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Build the guest channel with the requested commands already queued
fn guest_channel(config: &BridgeConfig, commands: &[String]) -> Option<Arc<GuestChannel>> {
    if !config.guest_enabled {
        return None;
    }
    let channel = Arc::new(GuestChannel::new(config.guest.clone()));
    for command in commands {
        channel.exec(command);
    }
    Some(channel)
}

/// Wait for SIGTERM or SIGINT
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

async fn run(config: BridgeConfig, commands: &[String]) -> Result<()> {
    let backend = config
        .create_audio_backend()
        .context("Failed to create audio backend")?;
    if config.audio_enabled {
        info!(
            backend = %config.audio_backend,
            output = ?config.audio_output,
            "Audio backend selected"
        );
    }
    let guest = guest_channel(&config, commands);
    let mut environment = Environment::from_config(&config, backend, guest);

    info!(components = ?environment.component_names(), "Starting environment");
    environment
        .start_all()
        .context("Failed to start environment")?;

    let waited = wait_for_shutdown().await;

    // Broker and guest threads are joined on stop
    tokio::task::spawn_blocking(move || environment.stop_all())
        .await
        .context("Shutdown task failed")?;

    waited
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Hostbridge daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;
    info!(
        root_dir = %config.root_dir.display(),
        source = %config.source(),
        "Configuration loaded"
    );

    let pid_path = pidfile::pid_path(&config.root_dir);
    pidfile::check_existing_daemon(&pid_path)?;
    pidfile::write_pid_file(&pid_path)?;

    let result = run(config, &args.exec).await;

    info!("Shutting down...");
    pidfile::remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Hostbridge daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
