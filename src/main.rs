//! TIMELAPSE daemon entrypoint

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use timelapse::config::MetricsFormat;
use timelapse::events::FanoutSink;
#[cfg(target_family = "unix")]
use timelapse::events::unix::UnixBroadcast;
use timelapse::metrics::MetricsSink;
use timelapse::{
    Error, Result, ShutdownTrigger, StopReason, TimelapseConfig, TracingSink, logging, metrics,
    open_session, shutdown_channel,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "timelapse",
    version,
    about = "Unattended adaptive time-lapse capture daemon"
)]
struct Cli {
    /// Configuration file (toml/yaml). Defaults to timelapse.{yaml,toml} in cwd or XDG config.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override the project name used in filenames
    #[arg(long, value_name = "NAME")]
    project: Option<String>,

    /// Override the base interval in seconds
    #[arg(long, value_name = "SECONDS")]
    interval: Option<f64>,

    /// Capture a single frame and exit
    #[arg(long, conflicts_with = "count")]
    once: bool,

    /// Stop after this many frames
    #[arg(long, value_name = "N")]
    count: Option<u64>,

    /// Use the simulated camera instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Validate the configuration, print it resolved, and exit
    #[arg(long)]
    check_config: bool,

    /// Enable metrics output regardless of configuration file settings
    #[arg(long)]
    metrics: bool,

    /// Override metrics endpoint bind address (e.g. 127.0.0.1:9900)
    #[arg(long, value_name = "ADDR")]
    metrics_bind: Option<String>,

    /// Override metrics endpoint format (`json` or `prometheus`)
    #[arg(long, value_name = "FORMAT")]
    metrics_format: Option<String>,

    /// Stream capture events over the specified Unix domain socket path
    #[arg(long, value_name = "PATH")]
    unix_socket: Option<PathBuf>,

    /// List detected V4L2 cameras and exit
    #[cfg(feature = "camera")]
    #[arg(long)]
    list_cameras: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    #[cfg(feature = "camera")]
    if cli.list_cameras {
        return list_cameras();
    }

    let mut config = TimelapseConfig::load(cli.config.as_deref())?;
    apply_cli_overrides(&cli, &mut config)?;

    if cli.check_config {
        config.validate()?;
        let resolved = serde_yaml::to_string(&config)
            .map_err(|e| Error::Config(format!("Failed to render configuration: {e}")))?;
        print!("{resolved}");
        return Ok(());
    }

    logging::init(&config.logging)?;

    let mut sinks = FanoutSink::new().with(Arc::new(TracingSink));

    let metrics_enabled = config.logging.metrics || config.logging.metrics_endpoint.is_some();
    if metrics_enabled {
        metrics::enable(config.logging.metrics_interval_secs);
        if let Some(ref endpoint) = config.logging.metrics_endpoint {
            let addr = SocketAddr::from_str(endpoint).map_err(|e| {
                Error::Config(format!("Invalid metrics endpoint '{endpoint}': {e}"))
            })?;
            metrics::spawn_http_endpoint(addr, config.logging.metrics_format)?;
        }
        sinks.push(Arc::new(MetricsSink));
    }

    #[cfg(target_family = "unix")]
    if let Some(path) = config.api.unix_socket.clone() {
        sinks.push(UnixBroadcast::bind(&path).await?);
    }

    info!(
        directory = %config.output.directory.display(),
        project = %config.output.project_name,
        interval_secs = config.scheduling.base_interval,
        "Starting time-lapse capture"
    );

    let mut session = open_session(&config, Arc::new(sinks)).await?;

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(forward_signals(trigger));

    let summary = session.run(shutdown).await?;
    info!(
        frames = summary.frames,
        next_counter = summary.next_counter,
        reason = ?summary.reason,
        "Time-lapse capture finished"
    );
    if summary.reason == StopReason::Shutdown {
        info!("Stopped by signal");
    }
    Ok(())
}

fn apply_cli_overrides(cli: &Cli, config: &mut TimelapseConfig) -> Result<()> {
    if let Some(ref dir) = cli.output {
        config.output.directory = dir.clone();
    }
    if let Some(ref project) = cli.project {
        config.output.project_name = project.clone();
    }
    if let Some(interval) = cli.interval {
        config.scheduling.base_interval = interval;
    }
    if cli.once {
        config.scheduling.max_captures = Some(1);
    } else if let Some(count) = cli.count {
        config.scheduling.max_captures = Some(count);
    }
    if cli.simulate {
        config.camera.backend = Some("simulated".to_string());
    }

    if cli.metrics {
        config.logging.metrics = true;
    }
    if let Some(ref bind) = cli.metrics_bind {
        config.logging.metrics_endpoint = Some(bind.clone());
        config.logging.metrics = true;
    }
    if let Some(ref format) = cli.metrics_format {
        config.logging.metrics_format = format.parse::<MetricsFormat>().map_err(Error::Config)?;
    }
    if let Some(ref socket) = cli.unix_socket {
        config.api.unix_socket = Some(socket.clone());
    }
    Ok(())
}

/// Trigger a graceful shutdown on SIGINT or SIGTERM.
async fn forward_signals(trigger: ShutdownTrigger) {
    #[cfg(target_family = "unix")]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!("Failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(target_family = "unix"))]
    let _ = tokio::signal::ctrl_c().await;

    info!("Shutdown requested, finishing in-flight frame");
    trigger.trigger();
}

#[cfg(feature = "camera")]
fn list_cameras() -> Result<()> {
    let devices = timelapse::camera::list_devices()?;
    if devices.is_empty() {
        println!("No V4L2 cameras detected");
    } else {
        println!("Discovered cameras:");
        for dev in devices {
            println!("  [{}] {} ({})", dev.index, dev.name, dev.path);
        }
    }
    Ok(())
}
