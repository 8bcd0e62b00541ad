//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use syscalc_bus::{BusValue, DeviceType, ValueSnapshot};

use crate::context::DelegateContext;
use crate::delegate::{Delegate, InputSpec, OutputSpec, OutputValues};

pub const HUB_PATH: &str = "/Hub";
pub const SYSTEM_TYPE_PATH: &str = "/SystemType";

const ESS_ASSISTANT_ID: i64 = 5;

/// Wiring topology of the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubClass {
    /// Grid-parallel inverter with an AC setpoint (Hub-4 / ESS).
    Hub4 { ess: bool },
    /// DC-coupled solar with external charge-voltage control.
    Hub1,
    /// AC PV on the inverter output.
    Hub2,
    /// AC PV on the grid or genset input.
    Hub3,
}

impl HubClass {
    pub fn number(self) -> i64 {
        match self {
            HubClass::Hub4 { .. } => 4,
            HubClass::Hub1 => 1,
            HubClass::Hub2 => 2,
            HubClass::Hub3 => 3,
        }
    }

    pub fn system_type(self) -> &'static str {
        match self {
            HubClass::Hub4 { ess: true } => "ESS",
            HubClass::Hub4 { ess: false } => "Hub-4",
            HubClass::Hub1 => "Hub-1",
            HubClass::Hub2 => "Hub-2",
            HubClass::Hub3 => "Hub-3",
        }
    }
}

/// Classify the installation. Rules are tried in order 4, 1, 2, 3; the first match wins.
pub fn classify(snapshot: &ValueSnapshot) -> Option<HubClass> {
    let inverter = snapshot.inverter_service();
    let inverter_value = |path: &str| inverter.and_then(|service| snapshot.get(service, path));

    if inverter_value("/Hub4/AcPowerSetpoint").is_some() {
        let ess = inverter_value("/Hub4/AssistantId").and_then(BusValue::as_i64)
            == Some(ESS_ASSISTANT_ID);
        return Some(HubClass::Hub4 { ess });
    }
    if inverter_value("/Hub1/ChargeVoltage").is_some() || snapshot.system("/Dc/Pv/Power").is_some() {
        return Some(HubClass::Hub1);
    }
    if snapshot.system("/Ac/PvOnOutput/Total/Power").is_some() {
        return Some(HubClass::Hub2);
    }
    if snapshot.system("/Ac/PvOnGrid/Total/Power").is_some()
        || snapshot.system("/Ac/PvOnGenset/Total/Power").is_some()
    {
        return Some(HubClass::Hub3);
    }
    None
}

/// Publishes `/Hub` and `/SystemType` every tick.
#[derive(Debug, Default)]
pub struct HubClassifier;

impl HubClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl Delegate for HubClassifier {
    fn name(&self) -> &'static str {
        "hub_classifier"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::new(
            DeviceType::Inverter,
            &["/Hub4/AcPowerSetpoint", "/Hub4/AssistantId", "/Hub1/ChargeVoltage"],
        )]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![
            OutputSpec::new(HUB_PATH).with_format("%s"),
            OutputSpec::new(SYSTEM_TYPE_PATH).with_format("%s"),
        ]
    }

    fn on_tick(
        &mut self,
        snapshot: &ValueSnapshot,
        _ctx: &mut DelegateContext<'_>,
    ) -> Result<Option<OutputValues>> {
        let class = classify(snapshot);
        let mut outputs = OutputValues::new();
        outputs.insert(HUB_PATH.to_owned(), class.map(|c| BusValue::Int(c.number())));
        outputs.insert(
            SYSTEM_TYPE_PATH.to_owned(),
            class.map(|c| BusValue::from(c.system_type())),
        );
        Ok(Some(outputs))
    }
}
