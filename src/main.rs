//! Playout GW - device state reconciliation runner
//!
//! Loads the device and mapping configuration, starts one instance per
//! device and feeds them resolved timeline states.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playout_gw::config::{ConfigUpdate, ConfigWatcher};
use playout_gw::service::registry_entry;
use playout_gw::timeline::{NextEvent, ResolvedLayer};
use playout_gw::{Conductor, DeviceEvent, DeviceEventKind, DeviceType, TimelineState};
use std::collections::BTreeMap;

/// Playout Gateway - turn timeline states into timed device commands
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "playout.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write daily rolling log files into this directory
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<String>,

    /// Resolved states to play (YAML or JSON list, times relative to start)
    #[arg(long)]
    states: Option<String>,

    /// List known device types and exit
    #[arg(long)]
    list_devices: bool,
}

/// One entry of a states file; `time` is milliseconds after start
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduledState {
    time: i64,
    #[serde(default)]
    layers: BTreeMap<String, ResolvedLayer>,
    #[serde(default)]
    next_events: Vec<NextEvent>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let _log_guard = init_logging(&args.log_level, args.log_dir.as_deref())?;

    if args.list_devices {
        list_devices()?;
        return Ok(());
    }

    info!("Starting Playout GW v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let (config_watcher, initial_config) = ConfigWatcher::new(&args.config).await?;
    info!("Configuration loaded successfully with hot-reload enabled");

    let conductor = Conductor::from_config(&initial_config)
        .await
        .context("Failed to start devices")?;
    info!("Conductor started with {} devices", conductor.list_devices().await.len());

    if let Some(events) = conductor.take_event_receiver().await {
        tokio::spawn(log_events(events));
    }

    if let Some(path) = &args.states {
        play_states(&conductor, path).await?;
    }

    run_app(&conductor, config_watcher).await;

    info!("Shutting down...");
    conductor.shutdown_all().await?;
    info!("Playout GW shutdown complete");
    Ok(())
}

async fn run_app(conductor: &Conductor, mut config_watcher: ConfigWatcher) {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(update) = config_watcher.next_update() => match update {
                ConfigUpdate::Applied { config, changes } => {
                    info!("📝 Applying configuration changes ({})", changes);
                    match conductor.apply_config(&config, &changes).await {
                        Ok(()) => info!("✅ Configuration applied"),
                        Err(e) => warn!("⚠️  Configuration partly applied: {:#}", e),
                    }
                }
                ConfigUpdate::Rejected { reason } => {
                    warn!("⚠️  Configuration edit ignored, devices keep running: {}", reason);
                }
            },

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }
}

/// Queue every state of a states file, offset from now
async fn play_states(conductor: &Conductor, path: &str) -> Result<()> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read states file: {}", path))?;
    let states: Vec<ScheduledState> =
        serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse states file: {}", path))?;

    let start = conductor.current_time();
    info!("▶️  Playing {} states from {}", states.len(), path);

    for scheduled in states {
        let state = TimelineState {
            time: start + scheduled.time,
            layers: scheduled.layers,
            next_events: scheduled.next_events,
        };
        debug!(time = state.time, layers = state.layers.len(), "Queueing state");
        conductor.handle_state(state).await;
    }
    Ok(())
}

async fn log_events(mut events: tokio::sync::mpsc::UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = events.recv().await {
        let device_id = event.device_id;
        match event.kind {
            DeviceEventKind::ConnectionChanged(status) => {
                info!(%device_id, code = ?status.status_code, "🔌 Connection changed: {:?}", status.messages)
            }
            DeviceEventKind::CommandError(err) => {
                error!(%device_id, context = %err.context, timeline_obj_id = %err.timeline_obj_id, "❌ Command failed: {}", err)
            }
            DeviceEventKind::SlowSentCommand { context, delay_ms, .. } => {
                warn!(%device_id, %context, "🐢 Command sent {}ms late", delay_ms)
            }
            DeviceEventKind::SlowFulfilledCommand { context, delay_ms, .. } => {
                warn!(%device_id, %context, "🐢 Command fulfilled {}ms late", delay_ms)
            }
            DeviceEventKind::CommandReport {
                context,
                timeline_obj_id,
                sent_delay_ms,
                fulfilled_delay_ms,
            } => {
                info!(%device_id, %context, %timeline_obj_id, sent_delay_ms, fulfilled_delay_ms, "Command report")
            }
            DeviceEventKind::ResyncRequested => info!(%device_id, "Device asked for a resync"),
            DeviceEventKind::ResetResolver => debug!(%device_id, "Device asked for a resolver reset"),
            DeviceEventKind::Warning(message) => warn!(%device_id, "⚠️  {}", message),
            DeviceEventKind::Error(message) => error!(%device_id, "{}", message),
        }
    }
}

fn list_devices() -> Result<()> {
    println!("\n=== Device Types ===\n");
    for device_type in DeviceType::all() {
        let entry = registry_entry(*device_type)?;
        println!(
            "  {:<10} mode={:?} canConnect={} name=\"{}\"",
            device_type.as_str(),
            entry.execution_mode,
            entry.can_connect,
            (entry.device_name)("<id>")
        );
    }
    println!();
    Ok(())
}

fn init_logging(level: &str, log_dir: Option<&str>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "playout-gw.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
}
