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
use syscalc_bus::{BusReply, BusValue, DeviceType, RequestId, ValueSnapshot, SERVICE_PREFIX};
use syscalc_rt::{TimerAction, TimerHandle};
use tracing::{debug, warn};

use crate::context::DelegateContext;
use crate::delegate::{Delegate, InputSpec, OutputSpec, OutputValues, SettingSpec, TimerToken};

const SOC_TIMER: TimerToken = TimerToken(1);
const KICKOFF_TIMER: TimerToken = TimerToken(2);
const SOC_INTERVAL: Duration = Duration::from_secs(10);

pub const SETTING_NAME: &str = "writevebussoc";
pub const SETTING_PATH: &str = "/Settings/SystemSetup/WriteVebusSoc";
pub const CONTROL_SOC_PATH: &str = "/Control/VebusSoc";
pub const CONTROL_CURRENT_PATH: &str = "/Control/ExtraBatteryCurrent";

/// Assistants that forbid an external state of charge.
const HUB2_ASSISTANT_IDS: [u16; 8] = [0x0134, 0x0135, 0x0137, 0x0138, 0x013A, 0x0141, 0x0146, 0x014D];

/// Assistant ids packed little-endian, two bytes each. A trailing odd byte is ignored.
pub fn assistant_ids(raw: &[u8]) -> BTreeSet<u16> {
    raw.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Writes the system state of charge and the solar charge current into the inverter
/// so its own battery model keeps tracking.
pub struct InverterSocWriter {
    timer: Option<TimerHandle>,
    kickoff: Option<TimerHandle>,
    pending: HashMap<RequestId, &'static str>,
}

impl Default for InverterSocWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl InverterSocWriter {
    pub fn new() -> Self {
        Self {
            timer: None,
            kickoff: None,
            pending: HashMap::new(),
        }
    }

    fn must_write_soc(snapshot: &ValueSnapshot, inverter: &str) -> bool {
        let Some(active) = snapshot.system("/ActiveBatteryService").and_then(BusValue::as_str) else {
            return false;
        };
        if active.starts_with(&format!("{}vebus", SERVICE_PREFIX)) {
            return false;
        }
        // Unknown assistant list: assume a hub-2 assistant may be present.
        let Some(raw) = snapshot
            .get(inverter, "/Devices/0/Assistants")
            .and_then(BusValue::as_bytes)
        else {
            return false;
        };
        assistant_ids(raw)
            .iter()
            .all(|id| !HUB2_ASSISTANT_IDS.contains(id))
    }

    fn write_soc(&mut self, snapshot: &ValueSnapshot, ctx: &mut DelegateContext<'_>) {
        let mut written = false;
        if ctx.setting(SETTING_NAME) == Some(1) {
            if let Some(inverter) = snapshot.inverter_service() {
                if Self::must_write_soc(snapshot, inverter) {
                    if let Some(soc) = snapshot.system("/Dc/Battery/Soc").cloned() {
                        debug!(inverter, %soc, "writing state of charge to inverter");
                        let request = ctx.set_value(inverter, "/Soc", soc);
                        self.pending.insert(request, "/Soc");
                        written = true;
                    }
                }
            }
        }
        ctx.publish(CONTROL_SOC_PATH, Some(BusValue::from(written)));
    }
}

impl Delegate for InverterSocWriter {
    fn name(&self) -> &'static str {
        "inverter_soc_writer"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::new(
            DeviceType::Inverter,
            &["/Soc", "/ExtraBatteryCurrent", "/Devices/0/Assistants"],
        )]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![
            OutputSpec::new(CONTROL_SOC_PATH),
            OutputSpec::new(CONTROL_CURRENT_PATH).with_format("%s"),
        ]
    }

    fn settings(&self) -> Vec<SettingSpec> {
        vec![SettingSpec {
            name: SETTING_NAME,
            path: SETTING_PATH,
            default: 0,
            min: 0,
            max: 1,
        }]
    }

    fn on_start(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        ctx.publish(CONTROL_SOC_PATH, Some(BusValue::Int(0)));
        self.timer = Some(ctx.schedule_repeating(SOC_INTERVAL, SOC_TIMER));
        // First attempt once the loop is running rather than waiting a full interval.
        self.kickoff = Some(ctx.schedule_once(Duration::ZERO, KICKOFF_TIMER));
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        for timer in [self.timer.take(), self.kickoff.take()].into_iter().flatten() {
            ctx.cancel_timer(timer);
        }
        Ok(())
    }

    fn on_timer(
        &mut self,
        token: TimerToken,
        snapshot: &ValueSnapshot,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<TimerAction> {
        if token == KICKOFF_TIMER {
            self.kickoff = None;
        }
        self.write_soc(snapshot, ctx);
        Ok(TimerAction::Continue)
    }

    fn on_tick(
        &mut self,
        snapshot: &ValueSnapshot,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<Option<OutputValues>> {
        let mut written = false;
        if let Some(inverter) = snapshot.inverter_service() {
            if snapshot.contains(inverter, "/ExtraBatteryCurrent") {
                let current = snapshot.system_f64("/Dc/Pv/Current").unwrap_or(0.0);
                let request = ctx.set_value(inverter, "/ExtraBatteryCurrent", current);
                self.pending.insert(request, "/ExtraBatteryCurrent");
                written = true;
            }
        }
        let mut outputs = OutputValues::new();
        outputs.insert(CONTROL_CURRENT_PATH.to_owned(), Some(BusValue::from(written)));
        Ok(Some(outputs))
    }

    fn on_reply(&mut self, reply: &BusReply, _ctx: &mut DelegateContext<'_>) -> Result<()> {
        let Some(path) = self.pending.remove(&reply.request.id) else {
            return Ok(());
        };
        if let Err(err) = &reply.result {
            warn!(service = %reply.request.service, path, error = %err, "inverter write failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VEBUS: &str = "com.victronenergy.vebus.ttyO1";

    fn snapshot(assistants: Vec<u8>) -> ValueSnapshot {
        ValueSnapshot::new()
            .with_value(VEBUS, "/Devices/0/Assistants", assistants)
            .with_system("/ActiveBatteryService", "com.victronenergy.battery.ttyO3")
    }

    #[test]
    fn assistant_ids_are_little_endian_pairs() {
        let ids = assistant_ids(&[0x34, 0x01, 0x50, 0x00, 0x07]);
        assert_eq!(ids, BTreeSet::from([0x0134, 0x0050]));
    }

    #[test]
    fn hub2_assistant_blocks_soc_write() {
        assert!(InverterSocWriter::must_write_soc(&snapshot(vec![0x50, 0x00]), VEBUS));
        assert!(InverterSocWriter::must_write_soc(&snapshot(Vec::new()), VEBUS));
        assert!(!InverterSocWriter::must_write_soc(&snapshot(vec![0x4D, 0x01]), VEBUS));

        let inverter_as_battery = snapshot(Vec::new())
            .with_system("/ActiveBatteryService", "com.victronenergy.vebus.ttyO1");
        assert!(!InverterSocWriter::must_write_soc(&inverter_as_battery, VEBUS));

        let unknown = ValueSnapshot::new()
            .with_service(VEBUS)
            .with_system("/ActiveBatteryService", "com.victronenergy.battery.ttyO3");
        assert!(!InverterSocWriter::must_write_soc(&unknown, VEBUS));
    }
}
