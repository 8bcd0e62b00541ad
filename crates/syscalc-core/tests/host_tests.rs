//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod common;

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use common::*;
use indexmap::IndexMap;
use syscalc_bus::{BusValue, DeviceType, InMemoryBus, ValueSnapshot};
use syscalc_common::AppConfig;
use syscalc_core::delegates::hub::{HUB_PATH, SYSTEM_TYPE_PATH};
use syscalc_core::delegates::soc_writer::{CONTROL_CURRENT_PATH, CONTROL_SOC_PATH, SETTING_PATH};
use syscalc_core::delegates::{standard_delegates, HubClassifier, InverterSocWriter, ServiceMapper};
use syscalc_core::{
    Delegate, DelegateContext, DelegateHost, HostError, OutputSpec, OutputValues, SettingSpec,
    TimerToken, WriteOutcome,
};
use syscalc_metrics::{new_registry, HostMetrics};
use syscalc_rt::TimerAction;

/// Fails every tick and timer callback.
struct Faulty;

impl Delegate for Faulty {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn on_start(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        ctx.schedule_repeating(Duration::from_secs(1), TimerToken(9));
        Ok(())
    }

    fn on_tick(&mut self, _snapshot: &ValueSnapshot, _ctx: &mut DelegateContext<'_>) -> Result<Option<OutputValues>> {
        Err(anyhow!("tick exploded"))
    }

    fn on_timer(
        &mut self,
        _token: TimerToken,
        _snapshot: &ValueSnapshot,
        _ctx: &mut DelegateContext<'_>,
    ) -> Result<TimerAction> {
        Err(anyhow!("timer exploded"))
    }
}

/// Publishes how many ticks it has seen.
struct Counter {
    ticks: i64,
}

impl Delegate for Counter {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new("/Test/Ticks")]
    }

    fn on_tick(&mut self, _snapshot: &ValueSnapshot, _ctx: &mut DelegateContext<'_>) -> Result<Option<OutputValues>> {
        self.ticks += 1;
        let mut outputs = OutputValues::new();
        outputs.insert("/Test/Ticks".to_owned(), Some(BusValue::Int(self.ticks)));
        Ok(Some(outputs))
    }
}

/// Declares a setting under a name already used by the SoC writer.
struct ClashingSetting;

impl Delegate for ClashingSetting {
    fn name(&self) -> &'static str {
        "clashing_setting"
    }

    fn settings(&self) -> Vec<SettingSpec> {
        vec![SettingSpec {
            name: "writevebussoc",
            path: "/Settings/Test/Other",
            default: 0,
            min: 0,
            max: 1,
        }]
    }
}

fn build(delegates: Vec<Box<dyn Delegate>>, overrides: &[(&str, i64)]) -> Result<DelegateHost, HostError> {
    let overrides: IndexMap<String, i64> = overrides
        .iter()
        .map(|(name, value)| ((*name).to_owned(), *value))
        .collect();
    DelegateHost::new(delegates, Box::new(InMemoryBus::recording()), &overrides)
}

#[test]
fn failing_delegate_does_not_stop_the_others() {
    let bus = InMemoryBus::recording();
    let metrics = HostMetrics::new(new_registry()).expect("metrics register");
    let mut host = host(vec![Box::new(Faulty), Box::new(Counter { ticks: 0 })], &bus)
        .with_metrics(metrics.clone());
    let start = Instant::now();
    host.start(start);

    for second in 1..=3 {
        tick(&mut host, &bus, secs(start, second));
    }
    assert_eq!(host.item("/Test/Ticks"), Some(&BusValue::Int(3)));
    assert_eq!(metrics.delegate_failures("faulty", "on_tick"), 3);
    assert_eq!(metrics.delegate_failures("faulty", "on_timer"), 3);
    assert_eq!(metrics.delegate_failures("counter", "on_tick"), 0);
    assert_eq!(host.active_timers(), 1, "failing timer stays scheduled");
}

#[test]
fn duplicate_output_is_rejected() {
    let result = build(vec![Box::new(HubClassifier::new()), Box::new(HubClassifier::new())], &[]);
    match result {
        Err(HostError::DuplicateOutput { path, first, second }) => {
            assert_eq!(path, HUB_PATH);
            assert_eq!(first, "hub_classifier");
            assert_eq!(second, "hub_classifier");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("duplicate output accepted"),
    }
}

#[test]
fn duplicate_setting_is_rejected() {
    let result = build(vec![Box::new(InverterSocWriter::new()), Box::new(ClashingSetting)], &[]);
    assert!(matches!(
        result,
        Err(HostError::DuplicateSetting { ref name, .. }) if name == "writevebussoc"
    ));
}

#[test]
fn setting_overrides_are_clamped_and_checked() {
    let host = build(vec![Box::new(InverterSocWriter::new())], &[("writevebussoc", 7)])
        .expect("host builds");
    assert_eq!(host.settings().get("writevebussoc"), Some(1));

    let result = build(vec![Box::new(InverterSocWriter::new())], &[("nosuchsetting", 1)]);
    assert!(matches!(result, Err(HostError::UnknownSetting(ref name)) if name == "nosuchsetting"));
}

#[test]
fn writes_reach_settings_and_spare_read_only_items() {
    let bus = InMemoryBus::recording();
    let mut host = host(vec![Box::new(HubClassifier::new()), Box::new(InverterSocWriter::new())], &bus);
    let now = Instant::now();
    host.start(now);

    assert_eq!(host.write(SETTING_PATH, &BusValue::Int(1), now), WriteOutcome::Accepted);
    assert_eq!(host.settings().get("writevebussoc"), Some(1));
    assert_eq!(host.write(SETTING_PATH, &BusValue::from("yes"), now), WriteOutcome::Rejected);
    assert_eq!(host.write(HUB_PATH, &BusValue::Int(2), now), WriteOutcome::Rejected);
    assert_eq!(host.write("/No/Such/Path", &BusValue::Int(2), now), WriteOutcome::Rejected);
}

fn classified(snapshot: ValueSnapshot) -> (Option<BusValue>, Option<BusValue>) {
    let bus = InMemoryBus::recording();
    let mut host = host(vec![Box::new(HubClassifier::new())], &bus);
    let now = Instant::now();
    host.start(now);
    host.tick(snapshot, now);
    (host.item(HUB_PATH).cloned(), host.item(SYSTEM_TYPE_PATH).cloned())
}

#[test]
fn hub_classification_follows_rule_order() {
    let ess = ValueSnapshot::new()
        .with_value(VEBUS, "/Hub4/AcPowerSetpoint", 0.0)
        .with_value(VEBUS, "/Hub4/AssistantId", BusValue::Int(5))
        .with_value(VEBUS, "/Hub1/ChargeVoltage", 55.2)
        .with_system("/Ac/PvOnGrid/Total/Power", 1200.0);
    assert_eq!(classified(ess), (Some(BusValue::Int(4)), Some(BusValue::from("ESS"))));

    let hub4 = ValueSnapshot::new().with_value(VEBUS, "/Hub4/AcPowerSetpoint", 0.0);
    assert_eq!(classified(hub4), (Some(BusValue::Int(4)), Some(BusValue::from("Hub-4"))));

    let hub1 = ValueSnapshot::new()
        .with_service(VEBUS)
        .with_system("/Dc/Pv/Power", 300.0)
        .with_system("/Ac/PvOnOutput/Total/Power", 500.0);
    assert_eq!(classified(hub1), (Some(BusValue::Int(1)), Some(BusValue::from("Hub-1"))));

    let hub2 = ValueSnapshot::new()
        .with_system("/Ac/PvOnOutput/Total/Power", 500.0)
        .with_system("/Ac/PvOnGenset/Total/Power", 100.0);
    assert_eq!(classified(hub2), (Some(BusValue::Int(2)), Some(BusValue::from("Hub-2"))));

    let hub3 = ValueSnapshot::new().with_system("/Ac/PvOnGenset/Total/Power", 100.0);
    assert_eq!(classified(hub3), (Some(BusValue::Int(3)), Some(BusValue::from("Hub-3"))));

    assert_eq!(classified(ValueSnapshot::new().with_service(VEBUS)), (None, None));
}

#[test]
fn service_mapping_follows_device_lifecycle() {
    let bus = InMemoryBus::recording();
    let mut host = host(vec![Box::new(ServiceMapper::new())], &bus);
    let start = Instant::now();
    host.start(start);

    let device = add_device(&mut host, &bus, BATTERY, 3, None, &[], start);
    assert_eq!(
        host.item("/ServiceMapping/com_victronenergy_battery_3"),
        Some(&BusValue::from(BATTERY))
    );
    host.device_removed(&device, secs(start, 1));
    assert!(!host.has_item("/ServiceMapping/com_victronenergy_battery_3"));
}

#[test]
fn inverter_soc_is_written_only_when_enabled() {
    let bus = InMemoryBus::recording();
    let mut host = host(vec![Box::new(InverterSocWriter::new())], &bus);
    let start = Instant::now();
    host.start(start);
    assert_eq!(host.active_timers(), 2);

    bus.set_system("/ActiveBatteryService", Some(BusValue::from(BATTERY)));
    bus.set_system("/Dc/Battery/Soc", Some(BusValue::Float(87.5)));
    bus.set_system("/Dc/Pv/Current", Some(BusValue::Float(12.5)));
    add_device(
        &mut host,
        &bus,
        VEBUS,
        0,
        None,
        &[
            ("/Soc", BusValue::Float(50.0)),
            ("/ExtraBatteryCurrent", BusValue::Float(0.0)),
            ("/Devices/0/Assistants", BusValue::Bytes(vec![0x50, 0x00])),
        ],
        start,
    );
    tick(&mut host, &bus, start);
    assert_eq!(host.active_timers(), 1, "kickoff timer fired once");
    assert_eq!(bus.value(VEBUS, "/Soc"), Some(BusValue::Float(50.0)));
    assert_eq!(host.item(CONTROL_SOC_PATH), Some(&BusValue::Int(0)));
    assert_eq!(bus.value(VEBUS, "/ExtraBatteryCurrent"), Some(BusValue::Float(12.5)));
    assert_eq!(host.item(CONTROL_CURRENT_PATH), Some(&BusValue::Int(1)));

    assert_eq!(host.write(SETTING_PATH, &BusValue::Int(1), start), WriteOutcome::Accepted);
    turn(&mut host, secs(start, 10));
    assert_eq!(bus.value(VEBUS, "/Soc"), Some(BusValue::Float(87.5)));
    assert_eq!(host.item(CONTROL_SOC_PATH), Some(&BusValue::Int(1)));

    host.shutdown(secs(start, 11));
    assert_eq!(host.active_timers(), 0);
}

#[test]
fn hub2_assistant_blocks_inverter_soc() {
    let bus = InMemoryBus::recording();
    let overrides: IndexMap<String, i64> = [("writevebussoc".to_owned(), 1)].into_iter().collect();
    let mut host = DelegateHost::new(
        vec![Box::new(InverterSocWriter::new())],
        Box::new(bus.clone()),
        &overrides,
    )
    .expect("host builds");
    let start = Instant::now();
    host.start(start);
    bus.set_system("/ActiveBatteryService", Some(BusValue::from(BATTERY)));
    bus.set_system("/Dc/Battery/Soc", Some(BusValue::Float(87.5)));
    add_device(
        &mut host,
        &bus,
        VEBUS,
        0,
        None,
        &[
            ("/Soc", BusValue::Float(50.0)),
            ("/Devices/0/Assistants", BusValue::Bytes(vec![0x4D, 0x01])),
        ],
        start,
    );
    tick(&mut host, &bus, start);
    turn(&mut host, secs(start, 10));
    assert_eq!(bus.value(VEBUS, "/Soc"), Some(BusValue::Float(50.0)));
    assert_eq!(host.item(CONTROL_SOC_PATH), Some(&BusValue::Int(0)));
    assert_eq!(host.item(CONTROL_CURRENT_PATH), Some(&BusValue::Int(0)));
}

#[test]
fn standard_set_registers_without_conflicts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = AppConfig::default();
    config.hardware.relays = dir.path().join("relays");
    config.hardware.buzzer = dir.path().join("buzzer");

    let killer = RecordingKiller::new();
    let delegates = standard_delegates(&config, Box::new(killer));
    let host = DelegateHost::new(delegates, Box::new(InMemoryBus::recording()), &config.settings)
        .expect("standard delegates register");

    let subscriptions = host.subscriptions();
    assert!(subscriptions[&DeviceType::Inverter].contains("/Hub1/ChargeVoltage"));
    assert!(subscriptions[&DeviceType::SolarCharger].contains("/Link/NetworkMode"));
    assert!(subscriptions[&DeviceType::Battery].contains("/ProductId"));
    assert_eq!(host.settings().get("writevebussoc"), Some(0));
    assert!(host
        .descriptors()
        .iter()
        .any(|descriptor| descriptor.name == "service_supervisor"));

    config.supervisor.enabled = false;
    let delegates = standard_delegates(&config, Box::new(RecordingKiller::new()));
    assert!(delegates.iter().all(|delegate| delegate.name() != "service_supervisor"));
}
