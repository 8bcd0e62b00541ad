//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Service liveness watchdog."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Liveness watchdog for battery and solar-charger services.
//!
//! Every probe interval each supervised service gets one non-blocking read of a
//! cheap item. A service stays busy from the moment its probe is issued until the
//! reply is dispatched. A bus-level error means the service is alive but declining
//! and is ignored. Only a missing reply escalates: the owning process is looked up
//! (the one blocking call in the core) and killed so the init system restarts it.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use syscalc_bus::{BusReply, Device, DeviceType, RequestId, ValueSnapshot};
use syscalc_common::SupervisorConfig;
use syscalc_rt::{TimerAction, TimerHandle};
use tracing::{debug, error, info, warn};

use crate::context::DelegateContext;
use crate::delegate::{Delegate, TimerToken};
use crate::process::ProcessKiller;

const PROBE_TIMER: TimerToken = TimerToken(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    ProbeInFlight,
}

/// Shared view of the supervision table. Cloned into delegates that must avoid
/// talking to a service while it is being probed. Only touched from the loop thread.
#[derive(Debug, Clone, Default)]
pub struct SupervisionHandle {
    entries: Rc<RefCell<BTreeMap<String, ProbeState>>>,
}

impl SupervisionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self, service: &str) -> bool {
        self.entries.borrow().get(service) == Some(&ProbeState::ProbeInFlight)
    }

    pub fn is_supervised(&self, service: &str) -> bool {
        self.entries.borrow().contains_key(service)
    }

    pub fn supervised(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }

    fn track(&self, service: &str) {
        self.entries
            .borrow_mut()
            .entry(service.to_owned())
            .or_insert(ProbeState::Idle);
    }

    fn forget(&self, service: &str) {
        self.entries.borrow_mut().remove(service);
    }

    fn set(&self, service: &str, state: ProbeState) {
        if let Some(entry) = self.entries.borrow_mut().get_mut(service) {
            *entry = state;
        }
    }
}

/// Request context bound to the service a probe was issued for.
#[derive(Debug, Clone)]
struct ProbeContext {
    service: String,
}

pub struct ServiceSupervisor {
    interval: Duration,
    probe_path: String,
    handle: SupervisionHandle,
    killer: Box<dyn ProcessKiller>,
    pending: HashMap<RequestId, ProbeContext>,
    timer: Option<TimerHandle>,
}

impl ServiceSupervisor {
    pub fn new(config: &SupervisorConfig, handle: SupervisionHandle, killer: Box<dyn ProcessKiller>) -> Self {
        Self {
            interval: config.probe_interval,
            probe_path: config.probe_path.clone(),
            handle,
            killer,
            pending: HashMap::new(),
            timer: None,
        }
    }

    pub fn handle(&self) -> SupervisionHandle {
        self.handle.clone()
    }

    fn probe_all(&mut self, ctx: &mut DelegateContext<'_>) {
        for service in self.handle.supervised() {
            if self.handle.is_busy(&service) {
                debug!(service = %service, "previous probe still outstanding");
                continue;
            }
            self.handle.set(&service, ProbeState::ProbeInFlight);
            let request = ctx.get_value(&service, &self.probe_path);
            self.pending.insert(request, ProbeContext { service });
            if let Some(metrics) = ctx.metrics() {
                metrics.record_probe();
            }
        }
    }

    fn recover(&self, service: &str, ctx: &mut DelegateContext<'_>) {
        if let Some(metrics) = ctx.metrics() {
            metrics.record_probe_timeout();
        }
        if !self.handle.is_supervised(service) {
            info!(service, "unresponsive service already gone; nothing to recover");
            return;
        }
        let pid = match ctx.connection_pid(service) {
            Ok(pid) => pid,
            Err(err) => {
                warn!(service, error = %err, "cannot resolve process of unresponsive service");
                return;
            }
        };
        if pid <= 1 {
            warn!(service, pid, "not terminating unresponsive service with reserved pid");
            return;
        }
        error!(service, pid, "service not responding; killing its process");
        match self.killer.kill(pid) {
            Ok(()) => {
                if let Some(metrics) = ctx.metrics() {
                    metrics.record_process_kill();
                }
            }
            Err(err) => error!(service, pid, error = %err, "failed to kill unresponsive service"),
        }
    }
}

fn is_supervised_kind(kind: &DeviceType) -> bool {
    matches!(kind, DeviceType::Battery | DeviceType::SolarCharger)
}

impl Delegate for ServiceSupervisor {
    fn name(&self) -> &'static str {
        "service_supervisor"
    }

    fn on_start(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        self.timer = Some(ctx.schedule_repeating(self.interval, PROBE_TIMER));
        info!(interval_s = self.interval.as_secs(), path = %self.probe_path, "service supervision armed");
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        if let Some(timer) = self.timer.take() {
            ctx.cancel_timer(timer);
        }
        Ok(())
    }

    fn on_device_added(
        &mut self,
        device: &Device,
        _snapshot: &ValueSnapshot,
        _ctx: &mut DelegateContext<'_>,
    ) -> Result<()> {
        if is_supervised_kind(device.kind()) {
            self.handle.track(device.service());
            debug!(service = %device.service(), "service supervised");
        }
        Ok(())
    }

    fn on_device_removed(&mut self, device: &Device, _ctx: &mut DelegateContext<'_>) -> Result<()> {
        // A late reply must not be attributed to a restarted service of the same name.
        self.pending.retain(|_, probe| probe.service != device.service());
        if self.handle.is_supervised(device.service()) {
            self.handle.forget(device.service());
            debug!(service = %device.service(), "service no longer supervised");
        }
        Ok(())
    }

    fn on_timer(
        &mut self,
        _token: TimerToken,
        _snapshot: &ValueSnapshot,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<TimerAction> {
        self.probe_all(ctx);
        Ok(TimerAction::Continue)
    }

    fn on_reply(&mut self, reply: &BusReply, ctx: &mut DelegateContext<'_>) -> Result<()> {
        let Some(probe) = self.pending.remove(&reply.request.id) else {
            return Ok(());
        };
        self.handle.set(&probe.service, ProbeState::Idle);
        match &reply.result {
            Ok(_) => {}
            Err(err) if err.is_no_reply() => self.recover(&probe.service, ctx),
            Err(err) => {
                debug!(service = %probe.service, error = %err, "probe declined; service considered alive");
            }
        }
        Ok(())
    }
}
