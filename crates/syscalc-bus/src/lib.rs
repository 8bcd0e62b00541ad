//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus data model and client boundary."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Data model shared between the bus monitor and the delegates.
//!
//! Devices are addressed by their bus service name (`com.victronenergy.<type>.<suffix>`).
//! A [`ValueSnapshot`] is assembled once per tick and handed to every delegate
//! read-only. Writes and reads against live services go through a [`BusClient`], which
//! never blocks: requests are submitted and their [`BusReply`] is collected later.

pub mod client;
pub mod device;
pub mod error;
pub mod memory;
pub mod replay;
pub mod snapshot;
pub mod value;

pub use client::{BusClient, BusOperation, BusReply, BusRequest, RequestId};
pub use device::{Device, DeviceType, SERVICE_PREFIX};
pub use error::{BusError, Result};
pub use memory::{InMemoryBus, Lifecycle, Responsiveness};
pub use replay::{read_replay, MonitorEvent, ReplayError, ReplayRecord};
pub use snapshot::ValueSnapshot;
pub use value::BusValue;
