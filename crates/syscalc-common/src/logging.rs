//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing setup for the system-calc daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Tracing setup for `syscalcd`.
//!
//! The filter is assembled from the `[logging]` section: a base level, a table of
//! per-delegate defaults, then the configured `targets`. `SYSCALC_LOG` (or `RUST_LOG`)
//! replaces the assembled filter entirely.

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "SYSCALC_LOG";

/// Per-delegate levels applied unless `targets` names the same target. Supervision and
/// safety stay at `info` when the base level is raised; actuator refresh is held at `warn`.
const DELEGATE_TARGETS: &[(&str, &str)] = &[
    ("syscalc_core::delegates::supervisor", "info"),
    ("syscalc_core::delegates::safety", "info"),
    ("syscalc_core::delegates::relay", "warn"),
    ("syscalc_core::delegates::buzzer", "warn"),
    ("syscalc_bus::memory", "info"),
];

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Filter directives for `config`, ignoring the environment.
pub fn config_directives(config: &LoggingConfig) -> String {
    let mut directives = vec![config.level.clone()];
    for (target, level) in DELEGATE_TARGETS {
        if !config.targets.contains_key(*target) {
            directives.push(format!("{target}={level}"));
        }
    }
    for (target, level) in &config.targets {
        directives.push(format!("{target}={level}"));
    }
    directives.join(",")
}

/// Directive from `SYSCALC_LOG`, then `RUST_LOG`.
fn env_directive() -> Option<String> {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok()
        .filter(|directive| !directive.trim().is_empty())
}

/// Install the daemon's subscriber: stdout in the configured format plus, unless
/// disabled, a daily rolling JSON file under `config.directory`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let configured = config_directives(config);
    let mut rejected = None;
    let filter = match env_directive() {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            rejected = Some((directive, err.to_string()));
            EnvFilter::new(&configured)
        }),
        None => EnvFilter::try_new(&configured)?,
    };

    let mut guards = Vec::with_capacity(2);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = if config.file {
        std::fs::create_dir_all(&config.directory)?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (file_writer, file_guard) =
            tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
        guards.push(file_guard);
        Some(
            fmt::layer()
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(file_writer)
                .boxed(),
        )
    } else {
        None
    };
    let _ = GUARDS.set(guards);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    if let Some((directive, err)) = rejected {
        warn!(%directive, error = %err, filter = %configured, "invalid log directive in environment; using configured filter");
    }
    info!(
        service = %service_name,
        file = config.file,
        log_dir = %config.directory.display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

/// Install a plain subscriber that writes through the test harness. Repeated calls are harmless.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
