//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use tracing::level_filters::LevelFilter;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_probe_path() -> String {
    "/ProductId".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_charger_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_window_capacity() -> usize {
    40
}

fn default_min_samples() -> usize {
    20
}

fn default_rest_current() -> f64 {
    0.01
}

fn default_tolerance() -> f64 {
    0.10
}

fn default_relay_list() -> PathBuf {
    PathBuf::from("/etc/venus/relays")
}

fn default_buzzer_list() -> PathBuf {
    PathBuf::from("/etc/venus/buzzer")
}

fn default_relay_refresh() -> Duration {
    Duration::from_millis(5000)
}

fn default_buzzer_blink() -> Duration {
    Duration::from_millis(500)
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the controller core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub charger_sync: ChargerSyncConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Overrides for delegate settings, keyed by setting name.
    #[serde(default)]
    pub settings: IndexMap<String, i64>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "SYSCALC_CONFIG";

    /// Load configuration from disk, respecting the `SYSCALC_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.logging.validate()?;
        if self.runtime.tick_interval.is_zero() {
            return Err(anyhow!("runtime.tick_interval must be greater than zero"));
        }
        if self.supervisor.probe_interval.is_zero() {
            return Err(anyhow!("supervisor.probe_interval must be greater than zero"));
        }
        if !self.supervisor.probe_path.starts_with('/') {
            return Err(anyhow!(
                "supervisor.probe_path '{}' must be an absolute bus path",
                self.supervisor.probe_path
            ));
        }
        if self.charger_sync.interval.is_zero() {
            return Err(anyhow!("charger_sync.interval must be greater than zero"));
        }
        self.safety.validate()?;
        if self.hardware.relay_refresh.is_zero() || self.hardware.buzzer_blink.is_zero() {
            return Err(anyhow!("hardware timer intervals must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Write the rolling JSON file next to stdout. Off on read-only targets.
    #[serde(default = "default_true")]
    pub file: bool,
    /// Level for every target not listed in `targets`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Per-target levels, e.g. `"syscalc_core::delegates::supervisor" = "debug"`.
    #[serde(default)]
    pub targets: IndexMap<String, String>,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        self.level
            .parse::<LevelFilter>()
            .map_err(|_| anyhow!("logging.level '{}' is not a log level", self.level))?;
        for (target, level) in &self.targets {
            level.parse::<LevelFilter>().map_err(|_| {
                anyhow!("logging.targets.{} '{}' is not a log level", target, level)
            })?;
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file: true,
            level: default_log_level(),
            targets: IndexMap::new(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Period between value snapshots handed to the delegates.
    #[serde(default = "default_tick_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_probe_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub probe_interval: Duration,
    /// Value read as liveness probe; must exist on every supervised service.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval: default_probe_interval(),
            probe_path: default_probe_path(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerSyncConfig {
    #[serde(default = "default_charger_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
}

impl Default for ChargerSyncConfig {
    fn default() -> Self {
        Self {
            interval: default_charger_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Current magnitude (A) above which the battery is not at rest.
    #[serde(default = "default_rest_current")]
    pub rest_current: f64,
    /// Allowed relative deviation from the battery's own voltage.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_capacity == 0 {
            return Err(anyhow!("safety.window_capacity must be greater than zero"));
        }
        if self.min_samples == 0 || self.min_samples > self.window_capacity {
            return Err(anyhow!(
                "safety.min_samples ({}) must be within 1..={}",
                self.min_samples,
                self.window_capacity
            ));
        }
        if !(self.rest_current >= 0.0) {
            return Err(anyhow!("safety.rest_current must not be negative"));
        }
        if !(self.tolerance > 0.0) {
            return Err(anyhow!("safety.tolerance must be positive"));
        }
        Ok(())
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            min_samples: default_min_samples(),
            rest_current: default_rest_current(),
            tolerance: default_tolerance(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// File listing relay GPIO directories.
    #[serde(default = "default_relay_list")]
    pub relays: PathBuf,
    /// File listing the buzzer GPIO directory.
    #[serde(default = "default_buzzer_list")]
    pub buzzer: PathBuf,
    #[serde(default = "default_relay_refresh")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub relay_refresh: Duration,
    #[serde(default = "default_buzzer_blink")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub buzzer_blink: Duration,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relays: default_relay_list(),
            buzzer: default_buzzer_list(),
            relay_refresh: default_relay_refresh(),
            buzzer_blink: default_buzzer_blink(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
