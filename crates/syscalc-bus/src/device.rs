//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus data model and client boundary."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};

/// Prefix carried by every device service on the bus.
pub const SERVICE_PREFIX: &str = "com.victronenergy.";

/// Device class derived from the third segment of a service name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Battery,
    SolarCharger,
    /// Inverter/charger, published as `vebus`.
    #[serde(rename = "vebus")]
    Inverter,
    #[serde(untagged)]
    Other(String),
}

impl DeviceType {
    /// Derive the type from a full service name.
    pub fn from_service(service: &str) -> Result<Self> {
        let rest = service
            .strip_prefix(SERVICE_PREFIX)
            .ok_or_else(|| BusError::InvalidServiceName(service.to_owned()))?;
        let segment = rest.split('.').next().unwrap_or_default();
        if segment.is_empty() {
            return Err(BusError::InvalidServiceName(service.to_owned()));
        }
        Ok(Self::from_segment(segment))
    }

    fn from_segment(segment: &str) -> Self {
        match segment {
            "battery" => DeviceType::Battery,
            "solarcharger" => DeviceType::SolarCharger,
            "vebus" => DeviceType::Inverter,
            other => DeviceType::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeviceType::Battery => "battery",
            DeviceType::SolarCharger => "solarcharger",
            DeviceType::Inverter => "vebus",
            DeviceType::Other(name) => name,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant on the bus: stable service name plus device instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    service: String,
    instance: u32,
    kind: DeviceType,
}

impl Device {
    pub fn new(service: impl Into<String>, instance: u32) -> Result<Self> {
        let service = service.into();
        let kind = DeviceType::from_service(&service)?;
        Ok(Self {
            service,
            instance,
            kind,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn kind(&self) -> &DeviceType {
        &self.kind
    }

    /// Class-level name, e.g. `com.victronenergy.battery/3`.
    pub fn instance_name(&self) -> String {
        format!("{}{}/{}", SERVICE_PREFIX, self.kind.as_str(), self.instance)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.service, self.instance)
    }
}
