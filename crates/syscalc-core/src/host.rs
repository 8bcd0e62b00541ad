//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use indexmap::IndexMap;
use syscalc_bus::{BusClient, BusValue, Device, DeviceType, ValueSnapshot};
use syscalc_metrics::HostMetrics;
use syscalc_rt::TimerAction;
use tracing::{debug, info, warn};

use crate::context::{DelegateContext, HostCore};
use crate::delegate::{Delegate, DelegateDescriptor, OutputValues, WriteOutcome};
use crate::error::{HostError, Result};
use crate::settings::Settings;

/// Upper bound on reply polling rounds per dispatch, so a delegate that answers every
/// reply with a new request cannot starve the loop.
const MAX_REPLY_ROUNDS: usize = 16;

/// Drives every delegate on a single logical thread and isolates their failures.
pub struct DelegateHost {
    core: HostCore,
    delegates: Vec<Box<dyn Delegate>>,
    descriptors: Vec<DelegateDescriptor>,
    writable: BTreeMap<String, usize>,
    latest: ValueSnapshot,
    started: bool,
    stopped: bool,
}

impl DelegateHost {
    /// Register delegates, their outputs and settings. `overrides` are applied to the
    /// declared settings after registration and clamped to their bounds.
    pub fn new(
        delegates: Vec<Box<dyn Delegate>>,
        bus: Box<dyn BusClient>,
        overrides: &IndexMap<String, i64>,
    ) -> Result<Self> {
        let mut settings = Settings::new();
        let mut owners: BTreeMap<String, &'static str> = BTreeMap::new();
        let mut writable = BTreeMap::new();
        let mut items = BTreeMap::new();
        let mut descriptors = Vec::with_capacity(delegates.len());

        for (index, delegate) in delegates.iter().enumerate() {
            let descriptor = delegate.descriptor();
            for output in &descriptor.outputs {
                if let Some(first) = owners.insert(output.path.clone(), descriptor.name) {
                    return Err(HostError::DuplicateOutput {
                        path: output.path.clone(),
                        first,
                        second: descriptor.name,
                    });
                }
                if output.writable {
                    writable.insert(output.path.clone(), index);
                }
                items.insert(output.path.clone(), None);
            }
            for setting in &descriptor.settings {
                settings.declare(descriptor.name, setting.clone())?;
            }
            descriptors.push(descriptor);
        }

        for (name, value) in overrides {
            settings.set(name, *value)?;
        }

        let mut core = HostCore::new(bus, settings);
        core.items = items;
        info!(
            delegates = delegates.len(),
            outputs = core.items.len(),
            settings = core.settings.len(),
            "delegate host configured"
        );
        Ok(Self {
            core,
            delegates,
            descriptors,
            writable,
            latest: ValueSnapshot::new(),
            started: false,
            stopped: false,
        })
    }

    pub fn with_metrics(mut self, metrics: HostMetrics) -> Self {
        self.core.metrics = Some(metrics);
        self
    }

    pub fn descriptors(&self) -> &[DelegateDescriptor] {
        &self.descriptors
    }

    /// Union of every delegate's input paths per device type, for the bus monitor.
    pub fn subscriptions(&self) -> BTreeMap<DeviceType, BTreeSet<&'static str>> {
        let mut merged: BTreeMap<DeviceType, BTreeSet<&'static str>> = BTreeMap::new();
        for descriptor in &self.descriptors {
            for input in &descriptor.inputs {
                merged
                    .entry(input.kind.clone())
                    .or_default()
                    .extend(input.paths.iter().copied());
            }
        }
        merged
    }

    pub fn settings(&self) -> &Settings {
        &self.core.settings
    }

    pub fn item(&self, path: &str) -> Option<&BusValue> {
        self.core.items.get(path)?.as_ref()
    }

    pub fn has_item(&self, path: &str) -> bool {
        self.core.items.contains_key(path)
    }

    pub fn items(&self) -> &BTreeMap<String, Option<BusValue>> {
        &self.core.items
    }

    pub fn active_timers(&self) -> usize {
        self.core.timers.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.timers.next_deadline()
    }

    /// Snapshot most recently handed to the delegates.
    pub fn latest_snapshot(&self) -> &ValueSnapshot {
        &self.latest
    }

    /// Run `on_start` for every delegate. Subsequent calls are ignored.
    pub fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;
        for (index, delegate) in self.delegates.iter_mut().enumerate() {
            let mut ctx = DelegateContext::new(&mut self.core, index, now);
            let result = delegate.on_start(&mut ctx);
            report(&self.core, delegate.name(), "on_start", result);
        }
    }

    pub fn device_added(&mut self, device: &Device, snapshot: ValueSnapshot, now: Instant) {
        info!(service = %device.service(), instance = device.instance(), kind = %device.kind(), "device added");
        self.latest = snapshot;
        for (index, delegate) in self.delegates.iter_mut().enumerate() {
            let mut ctx = DelegateContext::new(&mut self.core, index, now);
            let result = delegate.on_device_added(device, &self.latest, &mut ctx);
            report(&self.core, delegate.name(), "on_device_added", result);
        }
    }

    pub fn device_removed(&mut self, device: &Device, now: Instant) {
        info!(service = %device.service(), instance = device.instance(), "device removed");
        for (index, delegate) in self.delegates.iter_mut().enumerate() {
            let mut ctx = DelegateContext::new(&mut self.core, index, now);
            let result = delegate.on_device_removed(device, &mut ctx);
            report(&self.core, delegate.name(), "on_device_removed", result);
        }
    }

    /// Hand `snapshot` to every delegate and publish what they return.
    ///
    /// Every delegate observes the same snapshot. The merged outputs of this tick are
    /// returned as well.
    pub fn tick(&mut self, snapshot: ValueSnapshot, now: Instant) -> OutputValues {
        self.latest = snapshot;
        if let Some(metrics) = &self.core.metrics {
            metrics.record_tick();
        }
        let mut merged = OutputValues::new();
        for (index, delegate) in self.delegates.iter_mut().enumerate() {
            let mut ctx = DelegateContext::new(&mut self.core, index, now);
            let result = delegate.on_tick(&self.latest, &mut ctx);
            if let Some(Some(values)) = report(&self.core, delegate.name(), "on_tick", result) {
                merged.extend(values);
            }
        }
        for (path, value) in &merged {
            self.core.items.insert(path.clone(), value.clone());
        }
        merged
    }

    /// Fire every timer due at `now`. Returns the number of callbacks run.
    ///
    /// A failing repeating timer stays scheduled; only an explicit `Stop` removes it.
    pub fn fire_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(due) = self.core.timers.pop_due(now) {
            fired += 1;
            let target = due.payload;
            let Some(delegate) = self.delegates.get_mut(target.delegate) else {
                self.core.timers.complete(due.handle, TimerAction::Stop, now);
                continue;
            };
            let mut ctx = DelegateContext::new(&mut self.core, target.delegate, now);
            let result = delegate.on_timer(target.token, &self.latest, &mut ctx);
            let action = report(&self.core, delegate.name(), "on_timer", result)
                .unwrap_or(TimerAction::Continue);
            self.core.timers.complete(due.handle, action, now);
        }
        fired
    }

    /// Route completed bus calls to the delegates that issued them.
    pub fn dispatch_replies(&mut self, now: Instant) -> usize {
        let mut dispatched = 0;
        for _ in 0..MAX_REPLY_ROUNDS {
            let replies = self.core.bus.poll_replies();
            if replies.is_empty() {
                break;
            }
            for reply in replies {
                let Some(index) = self.core.pending.remove(&reply.request.id) else {
                    debug!(request = %reply.request.id, "reply for unknown request dropped");
                    continue;
                };
                let Some(delegate) = self.delegates.get_mut(index) else {
                    continue;
                };
                dispatched += 1;
                let mut ctx = DelegateContext::new(&mut self.core, index, now);
                let result = delegate.on_reply(&reply, &mut ctx);
                report(&self.core, delegate.name(), "on_reply", result);
            }
        }
        dispatched
    }

    /// Apply a client write to a published item or a setting path.
    pub fn write(&mut self, path: &str, value: &BusValue, now: Instant) -> WriteOutcome {
        if let Some(name) = self.core.settings.name_for_path(path) {
            let Some(raw) = value.as_i64() else {
                warn!(path, %value, "non-integer value written to setting");
                return WriteOutcome::Rejected;
            };
            return match self.core.settings.set(name, raw) {
                Ok(_) => WriteOutcome::Accepted,
                Err(err) => {
                    warn!(path, error = %err, "setting write failed");
                    WriteOutcome::Rejected
                }
            };
        }

        let Some(&index) = self.writable.get(path) else {
            debug!(path, "write to read-only or unknown item rejected");
            return WriteOutcome::Rejected;
        };
        let Some(delegate) = self.delegates.get_mut(index) else {
            return WriteOutcome::Rejected;
        };
        let mut ctx = DelegateContext::new(&mut self.core, index, now);
        let result = delegate.on_write(path, value, &mut ctx);
        report(&self.core, delegate.name(), "on_write", result).unwrap_or(WriteOutcome::Rejected)
    }

    /// Run `on_stop` for every delegate and drop whatever timers remain.
    pub fn shutdown(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for (index, delegate) in self.delegates.iter_mut().enumerate() {
            let mut ctx = DelegateContext::new(&mut self.core, index, now);
            let result = delegate.on_stop(&mut ctx);
            report(&self.core, delegate.name(), "on_stop", result);
        }
        let leftover = self.core.timers.len();
        if leftover > 0 {
            warn!(timers = leftover, "timers still scheduled after shutdown");
        }
        info!("delegate host stopped");
    }
}

fn report<T>(core: &HostCore, delegate: &'static str, callback: &'static str, result: anyhow::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(delegate, callback, error = %format!("{:#}", err), "delegate callback failed");
            if let Some(metrics) = &core.metrics {
                metrics.record_delegate_failure(delegate, callback);
            }
            None
        }
    }
}
