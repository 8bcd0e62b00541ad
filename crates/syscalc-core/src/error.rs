//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use syscalc_bus::BusError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("setting '{name}' declared by both {first} and {second}")]
    DuplicateSetting {
        name: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("output {path} declared by both {first} and {second}")]
    DuplicateOutput {
        path: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("unknown setting '{0}'")]
    UnknownSetting(String),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("event loop is no longer running")]
    LoopClosed,
}
