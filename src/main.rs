//! abcored - Run Tor and a full node side by side
//!
//! The complete flow:
//! 1. Resolve the host configuration (CLI flags over an optional settings file)
//! 2. Start Tor and wait for its control port
//! 3. Start bitcoind or liquidd
//! 4. Stay in the foreground, reporting lifecycle events
//! 5. Stop both on Ctrl+C, or exit with an error if either one dies

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info};

use abcored::config::{default_conf, default_datadir};
use abcored::{
    ChannelNotifier, HostSettings, LifecycleEvent, LifecycleNotifier, NodeVariant,
    ReadinessProbe, Supervisor, SupervisorConfig, SupervisorHandle, SupervisorOptions,
    TracingNotifier,
};

/// abcored - Supervise a Tor proxy and a bitcoind/liquidd full node
///
/// Both executables must already be present in the base directory. Tor is
/// started first; the node is started once Tor accepts connections on its
/// control port. If either daemon exits, the other one is stopped too.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the `tor` and node executables
    ///
    /// Tor keeps its data in the `tordata` subdirectory.
    #[arg(short = 'b', long)]
    base_dir: Option<PathBuf>,

    /// Full node daemon to run
    #[arg(long, value_enum)]
    variant: Option<NodeVariant>,

    /// Node data directory (default: <base-dir>/.bitcoin)
    #[arg(long)]
    datadir: Option<PathBuf>,

    /// Node configuration file (default: <datadir>/bitcoin.conf)
    #[arg(long)]
    conf: Option<PathBuf>,

    /// Version shown once the node is running (default: the variant name)
    #[arg(long)]
    version_label: Option<String>,

    /// JSON settings file; command-line flags take precedence
    #[arg(short = 's', long)]
    settings: Option<PathBuf>,

    /// Start the node right after Tor without waiting for its control port
    #[arg(long)]
    no_readiness: bool,

    /// Seconds to wait for Tor's control port
    #[arg(long, default_value = "30")]
    readiness_timeout: u64,

    /// Seconds a daemon gets to exit after SIGTERM before it is killed
    #[arg(long, default_value = "10")]
    stop_grace: u64,
}

/// Resolve the supervisor configuration from CLI arguments and settings
fn build_config(cli: Cli) -> Result<(SupervisorConfig, SupervisorOptions)> {
    let settings = match &cli.settings {
        Some(path) => HostSettings::load(path)?,
        None => HostSettings::default(),
    };

    let base_dir = cli
        .base_dir
        .or(settings.base_dir)
        .context("--base-dir is required (or base_dir in the settings file)")?;

    // The supervisor never creates directories; the base must already exist
    let base_dir = fs::canonicalize(&base_dir)
        .with_context(|| format!("Base directory not found: {:?}", base_dir))?;

    let variant = cli.variant.or(settings.variant).unwrap_or_default();
    let datadir = cli
        .datadir
        .or(settings.datadir)
        .unwrap_or_else(|| default_datadir(&base_dir));
    let conf = cli
        .conf
        .or(settings.conf)
        .unwrap_or_else(|| default_conf(&datadir));
    let version_label = cli
        .version_label
        .or(settings.version_label)
        .unwrap_or_else(|| variant.to_string());

    let readiness = if cli.no_readiness {
        None
    } else {
        Some(ReadinessProbe::tor_control_port().with_timeout(Duration::from_secs(cli.readiness_timeout)))
    };

    let config = SupervisorConfig {
        base_dir,
        variant,
        datadir,
        conf,
        version_label,
        readiness,
    };

    let options = SupervisorOptions {
        stop_grace: Duration::from_secs(cli.stop_grace),
        ..SupervisorOptions::default()
    };

    Ok((config, options))
}

/// Start the pair and stay in the foreground until it stops
async fn run(config: SupervisorConfig, options: SupervisorOptions) -> Result<()> {
    info!("=== abcored ===");
    info!("Configuration:");
    info!("  Base directory: {:?}", config.base_dir);
    info!("  Node: {} ({})", config.variant, config.variant.daemon_name());
    info!("  Data directory: {:?}", config.datadir);
    info!("  Config file: {:?}", config.conf);
    info!("");

    let (notifier, mut events) = ChannelNotifier::new();
    let (supervisor, handle) = Supervisor::with_options(Arc::new(notifier), options);
    let actor = tokio::spawn(supervisor.run());
    let status = TracingNotifier;

    let result = supervise(&handle, &config, &mut events, &status).await;

    // The actor exits once the last handle is gone, after every child is reaped
    drop(handle);
    if let Err(e) = actor.await {
        error!("Supervisor task failed: {}", e);
    }
    while let Ok(event) = events.try_recv() {
        status.notify(event);
    }

    result
}

async fn supervise(
    supervisor: &SupervisorHandle,
    config: &SupervisorConfig,
    events: &mut UnboundedReceiver<LifecycleEvent>,
    status: &TracingNotifier,
) -> Result<()> {
    if let Err(e) = supervisor.start(config).await {
        bail!("Failed to start: {}", e);
    }

    info!("Press Ctrl+C to shut down...");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down...");
                supervisor.stop().await;
                return Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };

                let failure = match &event {
                    LifecycleEvent::Stopped { reason } if reason.is_failure() => {
                        Some(format!("{:?}", reason))
                    }
                    _ => None,
                };
                let stopped = matches!(event, LifecycleEvent::Stopped { .. });
                status.notify(event);

                if let Some(reason) = failure {
                    bail!("Daemons stopped unexpectedly: {}", reason);
                }
                if stopped {
                    return Ok(());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (config, options) = build_config(cli)?;

    if let Err(e) = run(config, options).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
