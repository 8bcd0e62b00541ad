//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Encode every family in `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metric families")
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "syscalcd_starts_total",
            "Total number of times the system-calc daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "syscalcd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }
}

/// Counters maintained by the delegate host and the delegates it drives.
#[derive(Clone, Debug)]
pub struct HostMetrics {
    registry: SharedRegistry,
    ticks: IntCounter,
    delegate_failures: IntCounterVec,
    probes: IntCounter,
    probe_timeouts: IntCounter,
    process_kills: IntCounter,
    breaker_trips: IntCounter,
}

impl HostMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let ticks = IntCounter::with_opts(Opts::new(
            "syscalc_ticks_total",
            "Value snapshots dispatched to the delegates",
        ))?;
        registry.register(Box::new(ticks.clone()))?;

        let delegate_failures = IntCounterVec::new(
            Opts::new(
                "syscalc_delegate_failures_total",
                "Delegate callbacks that returned an error, by delegate and callback",
            ),
            &["delegate", "callback"],
        )?;
        registry.register(Box::new(delegate_failures.clone()))?;

        let probes = IntCounter::with_opts(Opts::new(
            "syscalc_probes_total",
            "Liveness probes issued by the service supervisor",
        ))?;
        registry.register(Box::new(probes.clone()))?;

        let probe_timeouts = IntCounter::with_opts(Opts::new(
            "syscalc_probe_timeouts_total",
            "Liveness probes that received no reply",
        ))?;
        registry.register(Box::new(probe_timeouts.clone()))?;

        let process_kills = IntCounter::with_opts(Opts::new(
            "syscalc_process_kills_total",
            "Hung service processes terminated by the supervisor",
        ))?;
        registry.register(Box::new(process_kills.clone()))?;

        let breaker_trips = IntCounter::with_opts(Opts::new(
            "syscalc_circuit_breaker_trips_total",
            "Suspected battery circuit-breaker events",
        ))?;
        registry.register(Box::new(breaker_trips.clone()))?;

        Ok(Self {
            registry,
            ticks,
            delegate_failures,
            probes,
            probe_timeouts,
            process_kills,
            breaker_trips,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_tick(&self) {
        self.ticks.inc();
    }

    pub fn record_delegate_failure(&self, delegate: &str, callback: &str) {
        self.delegate_failures
            .with_label_values(&[delegate, callback])
            .inc();
    }

    pub fn record_probe(&self) {
        self.probes.inc();
    }

    pub fn record_probe_timeout(&self) {
        self.probe_timeouts.inc();
    }

    pub fn record_process_kill(&self) {
        self.process_kills.inc();
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips.inc();
    }

    pub fn delegate_failures(&self, delegate: &str, callback: &str) -> u64 {
        self.delegate_failures
            .with_label_values(&[delegate, callback])
            .get()
    }

    pub fn process_kills(&self) -> u64 {
        self.process_kills.get()
    }

    pub fn breaker_trips(&self) -> u64 {
        self.breaker_trips.get()
    }
}

pub use prometheus;
