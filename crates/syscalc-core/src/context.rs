//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use syscalc_bus::{BusClient, BusError, BusOperation, BusRequest, BusValue, RequestId};
use syscalc_metrics::HostMetrics;
use syscalc_rt::{TimerHandle, TimerService};
use tracing::trace;

use crate::delegate::{TimerTarget, TimerToken};
use crate::settings::Settings;

/// State shared by every delegate, owned by the host.
pub(crate) struct HostCore {
    pub(crate) timers: TimerService<TimerTarget>,
    pub(crate) bus: Box<dyn BusClient>,
    pub(crate) pending: HashMap<RequestId, usize>,
    pub(crate) items: BTreeMap<String, Option<BusValue>>,
    pub(crate) settings: Settings,
    pub(crate) metrics: Option<HostMetrics>,
    next_request: u64,
}

impl HostCore {
    pub(crate) fn new(bus: Box<dyn BusClient>, settings: Settings) -> Self {
        Self {
            timers: TimerService::new(),
            bus,
            pending: HashMap::new(),
            items: BTreeMap::new(),
            settings,
            metrics: None,
            next_request: 1,
        }
    }

    fn submit(&mut self, delegate: usize, service: &str, path: &str, op: BusOperation) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.pending.insert(id, delegate);
        self.bus.submit(BusRequest {
            id,
            service: service.to_owned(),
            path: path.to_owned(),
            op,
        });
        id
    }
}

/// Handle given to a delegate for the duration of one callback.
pub struct DelegateContext<'a> {
    core: &'a mut HostCore,
    delegate: usize,
    now: Instant,
}

impl<'a> DelegateContext<'a> {
    pub(crate) fn new(core: &'a mut HostCore, delegate: usize, now: Instant) -> Self {
        Self {
            core,
            delegate,
            now,
        }
    }

    /// Loop time at which this callback was dispatched.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn schedule_repeating(&mut self, interval: Duration, token: TimerToken) -> TimerHandle {
        let target = TimerTarget {
            delegate: self.delegate,
            token,
        };
        self.core.timers.schedule_repeating(self.now, interval, target)
    }

    pub fn schedule_once(&mut self, delay: Duration, token: TimerToken) -> TimerHandle {
        let target = TimerTarget {
            delegate: self.delegate,
            token,
        };
        self.core.timers.schedule_once(self.now, delay, target)
    }

    pub fn cancel_timer(&mut self, handle: TimerHandle) -> bool {
        self.core.timers.cancel(handle)
    }

    pub fn timer_active(&self, handle: TimerHandle) -> bool {
        self.core.timers.is_active(handle)
    }

    /// Submit a non-blocking read. The reply arrives through `on_reply`.
    pub fn get_value(&mut self, service: &str, path: &str) -> RequestId {
        trace!(service, path, "get value");
        self.core
            .submit(self.delegate, service, path, BusOperation::GetValue)
    }

    /// Submit a non-blocking write. The reply arrives through `on_reply`.
    pub fn set_value(&mut self, service: &str, path: &str, value: impl Into<BusValue>) -> RequestId {
        let value = value.into();
        trace!(service, path, %value, "set value");
        self.core
            .submit(self.delegate, service, path, BusOperation::SetValue(value))
    }

    /// Blocking lookup of the process owning `service`'s bus connection.
    pub fn connection_pid(&self, service: &str) -> Result<u32, BusError> {
        self.core.bus.connection_pid(service)
    }

    /// Create or update a published item.
    pub fn publish(&mut self, path: &str, value: Option<BusValue>) {
        self.core.items.insert(path.to_owned(), value);
    }

    /// Remove a published item altogether.
    pub fn retract(&mut self, path: &str) -> bool {
        self.core.items.remove(path).is_some()
    }

    /// Current value of a published item; `None` when absent or invalid.
    pub fn item(&self, path: &str) -> Option<&BusValue> {
        self.core.items.get(path)?.as_ref()
    }

    pub fn setting(&self, name: &str) -> Option<i64> {
        self.core.settings.get(name)
    }

    pub fn metrics(&self) -> Option<&HostMetrics> {
        self.core.metrics.as_ref()
    }
}
