//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus data model and client boundary."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{BusClient, BusOperation, BusReply, BusRequest};
use crate::device::Device;
use crate::error::{BusError, Result};
use crate::replay::MonitorEvent;
use crate::snapshot::ValueSnapshot;
use crate::value::BusValue;

/// Requests held for stalled services before the oldest is timed out.
const MAX_STALLED: usize = 256;

/// How a simulated service answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Responsiveness {
    #[default]
    Responsive,
    /// Answers every request with a bus-level error.
    Declining,
    /// Every request times out.
    Silent,
    /// Requests are held without reply until released.
    Stalled,
}

/// Device lifecycle change produced by applying a monitor event.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Added(Device),
    Removed(Device),
}

#[derive(Debug)]
struct ServiceState {
    instance: u32,
    pid: Option<u32>,
    values: BTreeMap<String, Option<BusValue>>,
    responsiveness: Responsiveness,
}

#[derive(Debug, Default)]
struct Inner {
    services: BTreeMap<String, ServiceState>,
    system: BTreeMap<String, BusValue>,
    replies: VecDeque<BusReply>,
    stalled: Vec<BusRequest>,
    recording: bool,
    requests: Vec<BusRequest>,
    pid_lookups: Vec<String>,
}

/// In-process bus backed by a mutex protected table. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBus {
    /// Bus that keeps no history of submitted requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus that records every request and pid lookup for later inspection.
    pub fn recording() -> Self {
        let bus = Self::default();
        bus.inner.lock().recording = true;
        bus
    }

    /// Register a service. Re-adding an existing service replaces it.
    pub fn add_service(&self, service: &str, instance: u32, pid: Option<u32>) -> Result<Device> {
        let device = Device::new(service, instance)?;
        self.inner.lock().services.insert(
            service.to_owned(),
            ServiceState {
                instance,
                pid,
                values: BTreeMap::new(),
                responsiveness: Responsiveness::Responsive,
            },
        );
        Ok(device)
    }

    /// Unregister a service. Requests held for it time out.
    pub fn remove_service(&self, service: &str) -> Option<Device> {
        let state = self.inner.lock().services.remove(service)?;
        self.release_stalled(service);
        Device::new(service, state.instance).ok()
    }

    /// Monitor-side value update.
    pub fn set_value(&self, service: &str, path: &str, value: impl Into<BusValue>) -> Result<()> {
        self.update(service, path, Some(value.into()))
    }

    /// Keep `path` on the service but mark its value invalid.
    pub fn invalidate(&self, service: &str, path: &str) -> Result<()> {
        self.update(service, path, None)
    }

    fn update(&self, service: &str, path: &str, value: Option<BusValue>) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .services
            .get_mut(service)
            .ok_or_else(|| BusError::UnknownService(service.to_owned()))?;
        state.values.insert(path.to_owned(), value);
        Ok(())
    }

    pub fn set_system(&self, path: &str, value: Option<BusValue>) {
        let mut inner = self.inner.lock();
        match value {
            Some(value) => {
                inner.system.insert(path.to_owned(), value);
            }
            None => {
                inner.system.remove(path);
            }
        }
    }

    pub fn set_responsiveness(&self, service: &str, mode: Responsiveness) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .services
            .get_mut(service)
            .ok_or_else(|| BusError::UnknownService(service.to_owned()))?;
        state.responsiveness = mode;
        Ok(())
    }

    pub fn value(&self, service: &str, path: &str) -> Option<BusValue> {
        self.inner
            .lock()
            .services
            .get(service)?
            .values
            .get(path)?
            .clone()
    }

    /// Assemble the immutable view handed to delegates.
    pub fn snapshot(&self) -> ValueSnapshot {
        let inner = self.inner.lock();
        let mut snapshot = ValueSnapshot::new();
        for (service, state) in &inner.services {
            snapshot.insert_service(service);
            for (path, value) in &state.values {
                if let Some(value) = value {
                    snapshot.insert(service, path, value.clone());
                }
            }
        }
        for (path, value) in &inner.system {
            snapshot.insert_system(path, value.clone());
        }
        snapshot
    }

    /// Every request submitted so far, in order. Empty unless built with [`InMemoryBus::recording`].
    pub fn requests(&self) -> Vec<BusRequest> {
        self.inner.lock().requests.clone()
    }

    /// Every write submitted so far as `(service, path, value)`.
    pub fn writes(&self) -> Vec<(String, String, BusValue)> {
        self.inner
            .lock()
            .requests
            .iter()
            .filter_map(|request| match &request.op {
                BusOperation::SetValue(value) => {
                    Some((request.service.clone(), request.path.clone(), value.clone()))
                }
                BusOperation::GetValue => None,
            })
            .collect()
    }

    pub fn clear_requests(&self) {
        self.inner.lock().requests.clear();
    }

    /// Services whose owning process was looked up.
    pub fn pid_lookups(&self) -> Vec<String> {
        self.inner.lock().pid_lookups.clone()
    }

    /// Time out every request held for a stalled service. Returns how many were released.
    pub fn release_stalled(&self, service: &str) -> usize {
        let mut inner = self.inner.lock();
        let (released, held): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.stalled)
            .into_iter()
            .partition(|request| request.service == service);
        inner.stalled = held;
        let count = released.len();
        for request in released {
            inner.replies.push_back(BusReply {
                result: Err(BusError::NoReply {
                    service: request.service.clone(),
                }),
                request,
            });
        }
        count
    }

    /// Apply one recorded monitor event, returning the lifecycle change it implies.
    pub fn apply(&self, event: &MonitorEvent) -> Result<Option<Lifecycle>> {
        match event {
            MonitorEvent::DeviceAdded {
                service,
                instance,
                pid,
                values,
            } => {
                let device = self.add_service(service, *instance, *pid)?;
                for (path, value) in values {
                    self.update(service, path, value.clone())?;
                }
                Ok(Some(Lifecycle::Added(device)))
            }
            MonitorEvent::DeviceRemoved { service } => {
                Ok(self.remove_service(service).map(Lifecycle::Removed))
            }
            MonitorEvent::Value {
                service,
                path,
                value,
            } => {
                self.update(service, path, value.clone())?;
                Ok(None)
            }
            MonitorEvent::System { path, value } => {
                self.set_system(path, value.clone());
                Ok(None)
            }
            MonitorEvent::Responsiveness { service, mode } => {
                self.set_responsiveness(service, *mode)?;
                Ok(None)
            }
        }
    }
}

fn answer(state: &mut ServiceState, request: &BusRequest) -> std::result::Result<Option<BusValue>, BusError> {
    let known = state.values.contains_key(&request.path);
    if !known {
        return Err(BusError::UnknownPath {
            service: request.service.clone(),
            path: request.path.clone(),
        });
    }
    match &request.op {
        BusOperation::GetValue => Ok(state.values.get(&request.path).cloned().flatten()),
        BusOperation::SetValue(value) => {
            state
                .values
                .insert(request.path.clone(), Some(value.clone()));
            Ok(None)
        }
    }
}

impl BusClient for InMemoryBus {
    fn submit(&self, request: BusRequest) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.recording {
            inner.requests.push(request.clone());
        }
        let result = match inner.services.get_mut(&request.service) {
            None => Err(BusError::UnknownService(request.service.clone())),
            Some(state) => match state.responsiveness {
                Responsiveness::Responsive => answer(state, &request),
                Responsiveness::Declining => Err(BusError::Remote {
                    service: request.service.clone(),
                    message: "request declined".to_owned(),
                }),
                Responsiveness::Silent => Err(BusError::NoReply {
                    service: request.service.clone(),
                }),
                Responsiveness::Stalled => {
                    debug!(service = %request.service, path = %request.path, "holding request for stalled service");
                    if inner.stalled.len() >= MAX_STALLED {
                        let oldest = inner.stalled.remove(0);
                        inner.replies.push_back(BusReply {
                            result: Err(BusError::NoReply {
                                service: oldest.service.clone(),
                            }),
                            request: oldest,
                        });
                    }
                    inner.stalled.push(request);
                    return;
                }
            },
        };
        inner.replies.push_back(BusReply { request, result });
    }

    fn poll_replies(&self) -> Vec<BusReply> {
        self.inner.lock().replies.drain(..).collect()
    }

    fn connection_pid(&self, service: &str) -> std::result::Result<u32, BusError> {
        let mut inner = self.inner.lock();
        if inner.recording {
            inner.pid_lookups.push(service.to_owned());
        }
        let state = inner
            .services
            .get(service)
            .ok_or_else(|| BusError::UnknownService(service.to_owned()))?;
        state.pid.ok_or_else(|| {
            warn!(service = %service, "no process registered for service");
            BusError::Remote {
                service: service.to_owned(),
                message: "connection has no unix process id".to_owned(),
            }
        })
    }
}
