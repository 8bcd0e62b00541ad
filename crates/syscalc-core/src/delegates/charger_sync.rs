//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::Result;
use syscalc_bus::{BusReply, BusValue, Device, DeviceType, RequestId, ValueSnapshot};
use syscalc_rt::{TimerAction, TimerHandle};
use tracing::{debug, info, warn};

use crate::context::DelegateContext;
use crate::delegate::{Delegate, InputSpec, OutputSpec, TimerToken};
use crate::delegates::supervisor::SupervisionHandle;

const SYNC_TIMER: TimerToken = TimerToken(1);

/// Bit 0: networked operation. Bit 2: remote charge-voltage control.
pub const NETWORK_MODE_HUB1: i64 = 1 | 4;
/// Firmware that also needs the inverter state to accept a charge voltage.
const STATE_COPY_FIRMWARE: i64 = 0x0117;

pub const CONTROL_VOLTAGE_PATH: &str = "/Control/SolarChargeVoltage";
pub const CONTROL_SENSE_PATH: &str = "/Control/SolarChargerVoltageSense";

/// Re-arms solar chargers into externally controlled charging.
///
/// The chargers fall back to their own algorithm unless the link values are
/// rewritten periodically, yet frequent writes crowd out their text protocol.
pub struct ChargerSynchronizer {
    interval: Duration,
    supervision: SupervisionHandle,
    chargers: BTreeSet<String>,
    timer: Option<TimerHandle>,
    pending: HashMap<RequestId, (String, &'static str)>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: Vec<String>,
    pub skipped_busy: Vec<String>,
    pub voltage_written: bool,
    pub sense_written: bool,
}

impl ChargerSynchronizer {
    pub fn new(interval: Duration, supervision: SupervisionHandle) -> Self {
        Self {
            interval,
            supervision,
            chargers: BTreeSet::new(),
            timer: None,
            pending: HashMap::new(),
        }
    }

    pub fn timer_active(&self) -> bool {
        self.timer.is_some()
    }

    fn write(&mut self, ctx: &mut DelegateContext<'_>, service: &str, path: &'static str, value: BusValue) {
        let request = ctx.set_value(service, path, value);
        self.pending.insert(request, (service.to_owned(), path));
    }

    /// Push the inverter's charge parameters to every idle, link-capable charger.
    pub fn sync(&mut self, snapshot: &ValueSnapshot, ctx: &mut DelegateContext<'_>) -> SyncReport {
        let mut report = SyncReport::default();
        let Some(inverter) = snapshot.inverter_service() else {
            debug!("no inverter; charger sync skipped");
            return self.publish(report, ctx);
        };
        let Some(charge_voltage) = snapshot.get(inverter, "/Hub1/ChargeVoltage").cloned() else {
            debug!(inverter, "inverter not hub-1 capable; charger sync skipped");
            return self.publish(report, ctx);
        };
        let inverter_state = snapshot.get(inverter, "/State").cloned();
        let sense_voltage = snapshot.get(inverter, "/Dc/0/Voltage").cloned();

        let chargers: Vec<String> = self.chargers.iter().cloned().collect();
        for service in chargers {
            if self.supervision.is_busy(&service) {
                debug!(service = %service, "charger busy with liveness probe; skipped this cycle");
                report.skipped_busy.push(service);
                continue;
            }
            if !snapshot.contains(&service, "/Link/NetworkMode") {
                debug!(service = %service, "charger has no link support");
                continue;
            }
            self.write(ctx, &service, "/Link/NetworkMode", BusValue::Int(NETWORK_MODE_HUB1));
            self.write(ctx, &service, "/Link/ChargeVoltage", charge_voltage.clone());
            report.voltage_written = true;

            let firmware = snapshot.get_i64(&service, "/FirmwareVersion");
            if firmware.map(|v| v & 0x0FFF) == Some(STATE_COPY_FIRMWARE) {
                if let Some(state) = &inverter_state {
                    self.write(ctx, &service, "/State", state.clone());
                }
            }
            if let Some(voltage) = &sense_voltage {
                if snapshot.contains(&service, "/Link/VoltageSense") {
                    self.write(ctx, &service, "/Link/VoltageSense", voltage.clone());
                    report.sense_written = true;
                }
            }
            report.written.push(service);
        }
        self.publish(report, ctx)
    }

    fn publish(&self, report: SyncReport, ctx: &mut DelegateContext<'_>) -> SyncReport {
        ctx.publish(CONTROL_VOLTAGE_PATH, Some(BusValue::from(report.voltage_written)));
        ctx.publish(CONTROL_SENSE_PATH, Some(BusValue::from(report.sense_written)));
        report
    }
}

impl Delegate for ChargerSynchronizer {
    fn name(&self) -> &'static str {
        "charger_sync"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![
            InputSpec::new(
                DeviceType::Inverter,
                &["/Hub1/ChargeVoltage", "/State", "/Dc/0/Voltage"],
            ),
            InputSpec::new(
                DeviceType::SolarCharger,
                &[
                    "/Link/NetworkMode",
                    "/Link/ChargeVoltage",
                    "/Link/VoltageSense",
                    "/State",
                    "/FirmwareVersion",
                ],
            ),
        ]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new(CONTROL_VOLTAGE_PATH), OutputSpec::new(CONTROL_SENSE_PATH)]
    }

    fn on_start(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        ctx.publish(CONTROL_VOLTAGE_PATH, Some(BusValue::Int(0)));
        ctx.publish(CONTROL_SENSE_PATH, Some(BusValue::Int(0)));
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
        snapshot: &ValueSnapshot,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<()> {
        if device.kind() != &DeviceType::SolarCharger {
            return Ok(());
        }
        self.chargers.insert(device.service().to_owned());
        if self.timer.is_none() {
            self.timer = Some(ctx.schedule_repeating(self.interval, SYNC_TIMER));
            info!(interval_s = self.interval.as_secs(), "charger sync timer started");
        }
        self.sync(snapshot, ctx);
        Ok(())
    }

    fn on_device_removed(&mut self, device: &Device, ctx: &mut DelegateContext<'_>) -> Result<()> {
        if !self.chargers.remove(device.service()) {
            return Ok(());
        }
        self.pending.retain(|_, (service, _)| service != device.service());
        if self.chargers.is_empty() {
            if let Some(timer) = self.timer.take() {
                ctx.cancel_timer(timer);
                info!("last charger gone; charger sync timer stopped");
            }
        }
        Ok(())
    }

    fn on_timer(
        &mut self,
        _token: TimerToken,
        snapshot: &ValueSnapshot,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<TimerAction> {
        self.sync(snapshot, ctx);
        Ok(TimerAction::Continue)
    }

    fn on_reply(&mut self, reply: &BusReply, _ctx: &mut DelegateContext<'_>) -> Result<()> {
        let Some((service, path)) = self.pending.remove(&reply.request.id) else {
            return Ok(());
        };
        if let Err(err) = &reply.result {
            warn!(service = %service, path, error = %err, "charger write failed; retrying next cycle");
        }
        Ok(())
    }
}
