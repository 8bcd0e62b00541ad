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

use crate::error::BusError;
use crate::value::BusValue;

/// Identifier correlating a submitted request with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusOperation {
    GetValue,
    SetValue(BusValue),
}

/// A single asynchronous call against one item of one service.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRequest {
    pub id: RequestId,
    pub service: String,
    pub path: String,
    pub op: BusOperation,
}

impl BusRequest {
    pub fn is_write(&self) -> bool {
        matches!(self.op, BusOperation::SetValue(_))
    }
}

/// Completion of a [`BusRequest`]. Reads carry the value; writes carry `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct BusReply {
    pub request: BusRequest,
    pub result: Result<Option<BusValue>, BusError>,
}

/// Boundary to the live bus.
///
/// `submit` must return immediately; the completion is delivered later through
/// `poll_replies` on the same loop. `connection_pid` is the only blocking call and is
/// reserved for resolving the owner of a service that has stopped replying.
pub trait BusClient {
    fn submit(&self, request: BusRequest);

    fn poll_replies(&self) -> Vec<BusReply>;

    fn connection_pid(&self, service: &str) -> Result<u32, BusError>;
}
