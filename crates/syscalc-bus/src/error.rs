//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus data model and client boundary."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusError {
    #[error("no reply from {service} within timeout")]
    NoReply { service: String },
    #[error("{service} returned an error: {message}")]
    Remote { service: String, message: String },
    #[error("service {0} is not on the bus")]
    UnknownService(String),
    #[error("{service} has no item {path}")]
    UnknownPath { service: String, path: String },
    #[error("invalid service name '{0}'")]
    InvalidServiceName(String),
}

impl BusError {
    /// True for the one failure class that indicates a hung service.
    pub fn is_no_reply(&self) -> bool {
        matches!(self, BusError::NoReply { .. })
    }
}
