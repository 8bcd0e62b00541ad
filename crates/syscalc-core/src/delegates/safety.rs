//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery circuit-breaker detection."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::Result;
use syscalc_bus::{BusReply, BusValue, Device, DeviceType, RequestId, ValueSnapshot};
use syscalc_common::SafetyConfig;
use tracing::{debug, error, info};

use crate::context::DelegateContext;
use crate::delegate::{Delegate, InputSpec, OutputSpec, OutputValues};

pub const ALARM_PATH: &str = "/Dc/Battery/Alarms/CircuitBreakerTripped";
pub const ALARM_OK: i64 = 0;
pub const ALARM_TRIPPED: i64 = 2;
/// Battery model whose internal breaker can open silently.
pub const MONITORED_PRODUCT_ID: i64 = 0xB004;
/// Inverter `/Mode` value that switches it off.
pub const INVERTER_MODE_OFF: i64 = 4;

/// Most recent inverter voltage samples taken while a battery rests.
///
/// Holds at most `capacity` samples; the oldest is dropped on overflow.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl VoltageWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `(min, max)` of the window, `None` when empty.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        let mut iter = self.samples.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }
}

/// Outcome of feeding one tick into a battery's window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Battery not at rest or readings missing; window cleared.
    Reset,
    /// Sample taken, not enough data yet.
    Collecting,
    /// Window within tolerance.
    Stable,
    /// Window outside tolerance of the battery's own voltage.
    Tripped { min: f64, max: f64, battery: f64 },
}

/// Streaming check for one battery, independent of the bus.
pub fn evaluate(
    window: &mut VoltageWindow,
    config: &SafetyConfig,
    current: Option<f64>,
    inverter_voltage: Option<f64>,
    battery_voltage: Option<f64>,
) -> Verdict {
    let at_rest = matches!(current, Some(i) if i.abs() <= config.rest_current);
    if !at_rest {
        window.clear();
        return Verdict::Reset;
    }
    let Some(sample) = inverter_voltage else {
        return Verdict::Collecting;
    };
    window.push(sample);
    if window.len() < config.min_samples {
        return Verdict::Collecting;
    }
    let (Some((min, max)), Some(battery)) = (window.bounds(), battery_voltage) else {
        return Verdict::Collecting;
    };
    if min < (1.0 - config.tolerance) * battery || max > (1.0 + config.tolerance) * battery {
        window.clear();
        Verdict::Tripped { min, max, battery }
    } else {
        Verdict::Stable
    }
}

/// Detects a suspected internal disconnect of monitored batteries and shuts the
/// inverter down when one is seen.
pub struct SafetyMonitor {
    config: SafetyConfig,
    windows: BTreeMap<String, VoltageWindow>,
    pending: HashMap<RequestId, String>,
}

impl SafetyMonitor {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            windows: BTreeMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn window(&self, battery: &str) -> Option<&VoltageWindow> {
        self.windows.get(battery)
    }
}

impl Delegate for SafetyMonitor {
    fn name(&self) -> &'static str {
        "safety_monitor"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![
            InputSpec::new(DeviceType::Battery, &["/ProductId", "/Dc/0/Current", "/Dc/0/Voltage"]),
            InputSpec::new(DeviceType::Inverter, &["/Dc/0/Voltage", "/Mode"]),
        ]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new(ALARM_PATH)]
    }

    fn on_device_added(
        &mut self,
        device: &Device,
        snapshot: &ValueSnapshot,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<()> {
        if device.kind() != &DeviceType::Battery
            || snapshot.get_i64(device.service(), "/ProductId") != Some(MONITORED_PRODUCT_ID)
        {
            return Ok(());
        }
        info!(service = %device.service(), "monitored battery appeared");
        self.windows.insert(
            device.service().to_owned(),
            VoltageWindow::new(self.config.window_capacity),
        );
        ctx.publish(ALARM_PATH, Some(BusValue::Int(ALARM_OK)));
        Ok(())
    }

    fn on_device_removed(&mut self, device: &Device, ctx: &mut DelegateContext<'_>) -> Result<()> {
        if self.windows.remove(device.service()).is_none() {
            return Ok(());
        }
        info!(service = %device.service(), "monitored battery disappeared");
        if self.windows.is_empty() {
            ctx.publish(ALARM_PATH, None);
        }
        Ok(())
    }

    fn on_tick(
        &mut self,
        snapshot: &ValueSnapshot,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<Option<OutputValues>> {
        if self.windows.is_empty() {
            return Ok(None);
        }
        let inverter = snapshot.inverter_service().map(str::to_owned);
        let mut outputs = None;
        for (battery, window) in self.windows.iter_mut() {
            let present = snapshot.has_service(battery);
            let verdict = match (&inverter, present) {
                (Some(inverter), true) => evaluate(
                    window,
                    &self.config,
                    snapshot.get_f64(battery, "/Dc/0/Current"),
                    snapshot.get_f64(inverter, "/Dc/0/Voltage"),
                    snapshot.get_f64(battery, "/Dc/0/Voltage"),
                ),
                _ => {
                    window.clear();
                    Verdict::Reset
                }
            };
            let Verdict::Tripped { min, max, battery: voltage } = verdict else {
                continue;
            };
            let Some(inverter) = &inverter else {
                continue;
            };
            error!(
                battery = %battery,
                battery_voltage = voltage,
                window_min = min,
                window_max = max,
                "battery circuit breaker suspected; switching inverter off"
            );
            if let Some(metrics) = ctx.metrics() {
                metrics.record_breaker_trip();
            }
            let request = ctx.set_value(inverter, "/Mode", INVERTER_MODE_OFF);
            self.pending.insert(request, inverter.clone());
            outputs
                .get_or_insert_with(OutputValues::new)
                .insert(ALARM_PATH.to_owned(), Some(BusValue::Int(ALARM_TRIPPED)));
        }
        Ok(outputs)
    }

    fn on_reply(&mut self, reply: &BusReply, _ctx: &mut DelegateContext<'_>) -> Result<()> {
        let Some(inverter) = self.pending.remove(&reply.request.id) else {
            return Ok(());
        };
        match &reply.result {
            Ok(_) => debug!(inverter = %inverter, "inverter switched off"),
            Err(err) => error!(inverter = %inverter, error = %err, "cannot switch off inverter"),
        }
        Ok(())
    }
}
