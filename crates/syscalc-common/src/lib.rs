//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the system-calc controller workspace.
//! This crate exposes configuration loading, tracing initialisation and
//! small time helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, ChargerSyncConfig, HardwareConfig, LoggingConfig, MetricsConfig, RuntimeConfig,
    SafetyConfig, SupervisorConfig,
};
pub use logging::{init_tracing, LogFormat};
