//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the system-calc daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use syscalc_bus::{read_replay, InMemoryBus, Lifecycle};
use syscalc_common::config::AppConfig;
use syscalc_common::init_tracing;
use syscalc_core::delegates::standard_delegates;
use syscalc_core::process::SignalKiller;
use syscalc_core::{DelegateDescriptor, DelegateHost, EventLoop, LoopEvent, LoopHandle};
use syscalc_metrics::{new_registry, spawn_http_server, DaemonMetrics, HostMetrics, SharedRegistry};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "System-calc controller daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Feed monitor events from a JSONL file into the in-process bus"
    )]
    replay: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the delegate host")]
    Run,
    #[command(about = "Print subscriptions, outputs and settings as JSON")]
    Describe,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/syscalc.toml"));
    candidates.push(PathBuf::from("/etc/syscalc/syscalc.toml"));

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let config = loaded_config.config;
    let load_duration = load_started.elapsed();

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("syscalcd", &config.logging)?;
            info!(config_path = %loaded_config.source.display(), "configuration loaded");
            daemon_metrics.inc_start();
            run_daemon(config, cli.replay, metrics_registry).await?
        }
        Commands::Describe => {
            let description = describe(&config)?;
            println!("{}", serde_json::to_string_pretty(&description)?);
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct Description {
    subscriptions: BTreeMap<String, BTreeSet<&'static str>>,
    delegates: Vec<DelegateDescriptor>,
}

fn build_host(config: &AppConfig, bus: &InMemoryBus) -> Result<DelegateHost> {
    let delegates = standard_delegates(config, Box::new(SignalKiller));
    DelegateHost::new(delegates, Box::new(bus.clone()), &config.settings)
        .context("failed to register delegates")
}

fn describe(config: &AppConfig) -> Result<Description> {
    let host = build_host(config, &InMemoryBus::new())?;
    let subscriptions = host
        .subscriptions()
        .into_iter()
        .map(|(kind, paths)| (kind.as_str().to_owned(), paths))
        .collect();
    Ok(Description {
        subscriptions,
        delegates: host.descriptors().to_vec(),
    })
}

async fn run_daemon(
    config: AppConfig,
    replay: Option<PathBuf>,
    metrics_registry: SharedRegistry,
) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let bus = InMemoryBus::new();
    let host = build_host(&config, &bus)?.with_metrics(HostMetrics::new(metrics_registry)?);
    let source = bus.clone();
    let event_loop = EventLoop::new(host, config.runtime.tick_interval)
        .with_source(Box::new(move || source.snapshot()));
    let handle = event_loop.handle();

    let feeder = async {
        let Some(path) = replay else {
            return;
        };
        if let Err(err) = replay_events(&path, &bus, &handle).await {
            error!(path = %path.display(), error = %format!("{:#}", err), "replay aborted");
        }
    };
    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received; shutting down"),
            Err(err) => warn!(error = %err, "cannot listen for ctrl-c; shutting down"),
        }
    };

    info!("daemon running; waiting for termination signal");
    let (host, ()) = tokio::join!(event_loop.run(shutdown), feeder);
    info!(items = host.items().len(), "delegate host released");

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

/// Apply recorded monitor events to `bus` and forward lifecycle changes to the loop.
async fn replay_events(path: &Path, bus: &InMemoryBus, handle: &LoopHandle) -> Result<()> {
    let records = read_replay(path)
        .with_context(|| format!("failed to read replay file {}", path.display()))?;
    info!(path = %path.display(), events = records.len(), "replaying monitor events");
    for record in records {
        if let Some(delay) = record.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match bus.apply(&record.event) {
            Ok(Some(Lifecycle::Added(device))) => handle.send(LoopEvent::DeviceAdded {
                device,
                snapshot: bus.snapshot(),
            })?,
            Ok(Some(Lifecycle::Removed(device))) => handle.device_removed(device)?,
            Ok(None) => handle.wake()?,
            Err(err) => warn!(error = %err, "replay event rejected"),
        }
    }
    info!("replay finished");
    Ok(())
}
