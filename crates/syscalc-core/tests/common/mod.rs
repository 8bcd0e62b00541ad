//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared fixtures for delegate host integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use syscalc_bus::{BusValue, Device, InMemoryBus};
use syscalc_core::process::{ProcessError, ProcessKiller};
use syscalc_core::{Delegate, DelegateHost};

pub const BATTERY: &str = "com.victronenergy.battery.ttyO3";
pub const CHARGER: &str = "com.victronenergy.solarcharger.ttyO2";
pub const VEBUS: &str = "com.victronenergy.vebus.ttyO1";

/// Records every pid it is asked to kill.
#[derive(Debug, Clone, Default)]
pub struct RecordingKiller {
    killed: Rc<RefCell<Vec<u32>>>,
}

impl RecordingKiller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.borrow().clone()
    }
}

impl ProcessKiller for RecordingKiller {
    fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        self.killed.borrow_mut().push(pid);
        Ok(())
    }
}

pub fn host(delegates: Vec<Box<dyn Delegate>>, bus: &InMemoryBus) -> DelegateHost {
    syscalc_common::logging::init_test_tracing();
    DelegateHost::new(delegates, Box::new(bus.clone()), &IndexMap::new()).expect("host builds")
}

pub fn secs(start: Instant, seconds: u64) -> Instant {
    start + Duration::from_secs(seconds)
}

/// Register `service` on the bus with `values`, then announce it to the host.
pub fn add_device(
    host: &mut DelegateHost,
    bus: &InMemoryBus,
    service: &str,
    instance: u32,
    pid: Option<u32>,
    values: &[(&str, BusValue)],
    now: Instant,
) -> Device {
    let device = bus.add_service(service, instance, pid).expect("valid service");
    for (path, value) in values {
        bus.set_value(service, path, value.clone()).expect("service exists");
    }
    host.device_added(&device, bus.snapshot(), now);
    device
}

/// One loop turn without a tick: timers, then replies.
pub fn turn(host: &mut DelegateHost, now: Instant) {
    host.fire_timers(now);
    host.dispatch_replies(now);
}

/// One loop turn with a tick from the bus's current state.
pub fn tick(host: &mut DelegateHost, bus: &InMemoryBus, now: Instant) {
    host.tick(bus.snapshot(), now);
    turn(host, now);
}
