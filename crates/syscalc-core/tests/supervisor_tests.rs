//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Service supervision and charger synchronisation integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod common;

use std::time::{Duration, Instant};

use common::*;
use syscalc_bus::{BusOperation, BusValue, InMemoryBus, Responsiveness};
use syscalc_common::SupervisorConfig;
use syscalc_core::delegates::charger_sync::{CONTROL_SENSE_PATH, CONTROL_VOLTAGE_PATH, NETWORK_MODE_HUB1};
use syscalc_core::delegates::{ChargerSynchronizer, ServiceSupervisor, SupervisionHandle};
use syscalc_core::{Delegate, DelegateHost};
use syscalc_metrics::{new_registry, HostMetrics};

fn supervisor(handle: &SupervisionHandle, killer: &RecordingKiller) -> Box<dyn Delegate> {
    Box::new(ServiceSupervisor::new(
        &SupervisorConfig::default(),
        handle.clone(),
        Box::new(killer.clone()),
    ))
}

fn probes(bus: &InMemoryBus, service: &str) -> usize {
    bus.requests()
        .iter()
        .filter(|request| request.service == service && matches!(request.op, BusOperation::GetValue))
        .count()
}

fn supervised_battery(mode: Responsiveness, pid: Option<u32>) -> (DelegateHost, InMemoryBus, SupervisionHandle, RecordingKiller, Instant) {
    let start = Instant::now();
    let bus = InMemoryBus::recording();
    let handle = SupervisionHandle::new();
    let killer = RecordingKiller::new();
    let mut host = host(vec![supervisor(&handle, &killer)], &bus);
    host.start(start);
    add_device(
        &mut host,
        &bus,
        BATTERY,
        3,
        pid,
        &[("/ProductId", BusValue::Int(0xB004))],
        start,
    );
    bus.set_responsiveness(BATTERY, mode).expect("battery registered");
    (host, bus, handle, killer, start)
}

#[test]
fn silent_service_is_killed_once_per_timeout() {
    let (mut host, bus, handle, killer, start) = supervised_battery(Responsiveness::Silent, Some(4242));
    let metrics = HostMetrics::new(new_registry()).expect("metrics register");
    host = host.with_metrics(metrics.clone());

    turn(&mut host, secs(start, 59));
    assert_eq!(probes(&bus, BATTERY), 0);

    turn(&mut host, secs(start, 60));
    assert_eq!(killer.killed(), vec![4242]);
    assert!(!handle.is_busy(BATTERY));

    turn(&mut host, secs(start, 120));
    assert_eq!(killer.killed(), vec![4242, 4242]);
    assert_eq!(probes(&bus, BATTERY), 2);
    assert_eq!(metrics.process_kills(), 2);
}

#[test]
fn reserved_pids_are_never_killed() {
    for pid in [0, 1] {
        let (mut host, bus, _handle, killer, start) = supervised_battery(Responsiveness::Silent, Some(pid));
        turn(&mut host, secs(start, 60));
        assert_eq!(bus.pid_lookups(), vec![BATTERY.to_owned()]);
        assert!(killer.killed().is_empty(), "pid {pid} must not be signalled");
    }
}

#[test]
fn stalled_service_is_busy_and_not_probed_twice() {
    let (mut host, bus, handle, killer, start) = supervised_battery(Responsiveness::Stalled, Some(900));

    turn(&mut host, secs(start, 60));
    assert_eq!(probes(&bus, BATTERY), 1);
    assert!(handle.is_busy(BATTERY));

    turn(&mut host, secs(start, 120));
    assert_eq!(probes(&bus, BATTERY), 1);
    assert!(killer.killed().is_empty());

    assert_eq!(bus.release_stalled(BATTERY), 1);
    host.dispatch_replies(secs(start, 125));
    assert_eq!(killer.killed(), vec![900]);
    assert!(!handle.is_busy(BATTERY));

    bus.set_responsiveness(BATTERY, Responsiveness::Responsive)
        .expect("battery registered");
    turn(&mut host, secs(start, 180));
    assert_eq!(probes(&bus, BATTERY), 2);
    assert_eq!(killer.killed(), vec![900]);
}

#[test]
fn declining_service_is_considered_alive() {
    let (mut host, bus, handle, killer, start) = supervised_battery(Responsiveness::Declining, Some(321));
    turn(&mut host, secs(start, 60));
    turn(&mut host, secs(start, 120));
    assert_eq!(probes(&bus, BATTERY), 2);
    assert!(bus.pid_lookups().is_empty());
    assert!(killer.killed().is_empty());
    assert!(!handle.is_busy(BATTERY));
}

#[test]
fn vanished_service_is_not_recovered() {
    let (mut host, bus, handle, killer, start) = supervised_battery(Responsiveness::Stalled, Some(555));
    turn(&mut host, secs(start, 60));
    assert!(handle.is_busy(BATTERY));

    let device = bus.remove_service(BATTERY).expect("battery registered");
    host.device_removed(&device, secs(start, 61));
    assert!(!handle.is_supervised(BATTERY));

    // Removal times out the held probe.
    assert_eq!(bus.release_stalled(BATTERY), 0);
    host.dispatch_replies(secs(start, 62));
    assert!(bus.pid_lookups().is_empty());
    assert!(killer.killed().is_empty());
}

#[test]
fn late_timeout_does_not_kill_a_restarted_service() {
    let (mut host, bus, handle, killer, start) = supervised_battery(Responsiveness::Stalled, Some(555));
    turn(&mut host, secs(start, 60));
    assert!(handle.is_busy(BATTERY));

    let device = bus.remove_service(BATTERY).expect("battery registered");
    host.device_removed(&device, secs(start, 61));
    add_device(
        &mut host,
        &bus,
        BATTERY,
        3,
        Some(777),
        &[("/ProductId", BusValue::Int(0xB004))],
        secs(start, 62),
    );
    bus.set_responsiveness(BATTERY, Responsiveness::Stalled)
        .expect("battery registered");

    // The restarted driver is probed while the old probe's timeout is still queued.
    turn(&mut host, secs(start, 120));
    assert!(killer.killed().is_empty());
    assert!(bus.pid_lookups().is_empty());
    assert!(handle.is_busy(BATTERY), "new probe is still outstanding");

    assert_eq!(bus.release_stalled(BATTERY), 1);
    host.dispatch_replies(secs(start, 125));
    assert_eq!(killer.killed(), vec![777]);
    assert!(!handle.is_busy(BATTERY));
}

#[test]
fn chargers_and_batteries_are_the_only_supervised_kinds() {
    let start = Instant::now();
    let bus = InMemoryBus::recording();
    let handle = SupervisionHandle::new();
    let killer = RecordingKiller::new();
    let mut host = host(vec![supervisor(&handle, &killer)], &bus);
    host.start(start);
    add_device(&mut host, &bus, VEBUS, 0, Some(10), &[], start);
    add_device(&mut host, &bus, CHARGER, 1, Some(11), &[], start);
    add_device(&mut host, &bus, BATTERY, 3, Some(12), &[], start);
    assert_eq!(handle.supervised(), vec![BATTERY.to_owned(), CHARGER.to_owned()]);
}

fn charger_values() -> Vec<(&'static str, BusValue)> {
    vec![
        ("/Link/NetworkMode", BusValue::Int(0)),
        ("/Link/ChargeVoltage", BusValue::Float(0.0)),
        ("/FirmwareVersion", BusValue::Int(0x0117)),
        ("/State", BusValue::Int(0)),
    ]
}

fn hub1_inverter(host: &mut DelegateHost, bus: &InMemoryBus, now: Instant) {
    add_device(
        host,
        bus,
        VEBUS,
        0,
        None,
        &[
            ("/Hub1/ChargeVoltage", BusValue::Float(55.2)),
            ("/State", BusValue::Int(3)),
            ("/Dc/0/Voltage", BusValue::Float(53.1)),
        ],
        now,
    );
}

#[test]
fn busy_charger_is_skipped_and_retried_next_cycle() {
    let start = Instant::now();
    let bus = InMemoryBus::recording();
    let handle = SupervisionHandle::new();
    let killer = RecordingKiller::new();
    let mut host = host(
        vec![
            supervisor(&handle, &killer),
            Box::new(ChargerSynchronizer::new(Duration::from_secs(10), handle.clone())),
        ],
        &bus,
    );
    host.start(start);
    hub1_inverter(&mut host, &bus, start);
    add_device(&mut host, &bus, CHARGER, 1, Some(77), &charger_values(), start);
    host.dispatch_replies(start);
    assert!(bus
        .writes()
        .contains(&(CHARGER.to_owned(), "/Link/NetworkMode".to_owned(), BusValue::Int(NETWORK_MODE_HUB1))));

    bus.set_responsiveness(CHARGER, Responsiveness::Stalled)
        .expect("charger registered");
    turn(&mut host, secs(start, 60));
    assert!(handle.is_busy(CHARGER));

    bus.clear_requests();
    turn(&mut host, secs(start, 70));
    assert!(bus.writes().is_empty(), "busy charger must not be written");
    assert_eq!(host.item(CONTROL_VOLTAGE_PATH), Some(&BusValue::Int(0)));

    bus.release_stalled(CHARGER);
    bus.set_responsiveness(CHARGER, Responsiveness::Responsive)
        .expect("charger registered");
    host.dispatch_replies(secs(start, 75));
    assert_eq!(killer.killed(), vec![77]);
    assert!(!handle.is_busy(CHARGER));

    bus.clear_requests();
    turn(&mut host, secs(start, 80));
    let writes = bus.writes();
    assert!(writes.contains(&(CHARGER.to_owned(), "/Link/ChargeVoltage".to_owned(), BusValue::Float(55.2))));
    assert!(writes.contains(&(CHARGER.to_owned(), "/State".to_owned(), BusValue::Int(3))));
    assert_eq!(host.item(CONTROL_VOLTAGE_PATH), Some(&BusValue::Int(1)));
}

#[test]
fn sync_timer_exists_only_while_chargers_exist() {
    let start = Instant::now();
    let bus = InMemoryBus::recording();
    let mut host = host(
        vec![Box::new(ChargerSynchronizer::new(
            Duration::from_secs(10),
            SupervisionHandle::new(),
        ))],
        &bus,
    );
    host.start(start);
    assert_eq!(host.active_timers(), 0);

    let first = add_device(&mut host, &bus, CHARGER, 1, None, &charger_values(), start);
    assert_eq!(host.active_timers(), 1);
    let second = add_device(
        &mut host,
        &bus,
        "com.victronenergy.solarcharger.ttyO4",
        2,
        None,
        &charger_values(),
        start,
    );
    assert_eq!(host.active_timers(), 1);

    host.device_removed(&first, secs(start, 5));
    assert_eq!(host.active_timers(), 1);
    host.device_removed(&second, secs(start, 6));
    assert_eq!(host.active_timers(), 0);

    add_device(&mut host, &bus, CHARGER, 1, None, &charger_values(), secs(start, 7));
    assert_eq!(host.active_timers(), 1);
    host.shutdown(secs(start, 8));
    assert_eq!(host.active_timers(), 0);
}

#[test]
fn charger_without_link_support_is_left_untouched() {
    let start = Instant::now();
    let bus = InMemoryBus::recording();
    let metrics = HostMetrics::new(new_registry()).expect("metrics register");
    let mut host = host(
        vec![Box::new(ChargerSynchronizer::new(
            Duration::from_secs(10),
            SupervisionHandle::new(),
        ))],
        &bus,
    )
    .with_metrics(metrics.clone());
    host.start(start);
    hub1_inverter(&mut host, &bus, start);
    add_device(
        &mut host,
        &bus,
        CHARGER,
        1,
        None,
        &[("/Link/ChargeVoltage", BusValue::Float(0.0))],
        start,
    );
    turn(&mut host, secs(start, 10));
    turn(&mut host, secs(start, 20));

    assert!(bus.writes().is_empty());
    assert_eq!(host.item(CONTROL_VOLTAGE_PATH), Some(&BusValue::Int(0)));
    assert_eq!(host.item(CONTROL_SENSE_PATH), Some(&BusValue::Int(0)));
    assert_eq!(metrics.delegate_failures("charger_sync", "on_timer"), 0);
    assert_eq!(metrics.delegate_failures("charger_sync", "on_device_added"), 0);
}

#[test]
fn voltage_sense_is_forwarded_when_supported() {
    let start = Instant::now();
    let bus = InMemoryBus::recording();
    let mut host = host(
        vec![Box::new(ChargerSynchronizer::new(
            Duration::from_secs(10),
            SupervisionHandle::new(),
        ))],
        &bus,
    );
    host.start(start);
    hub1_inverter(&mut host, &bus, start);
    let mut values = charger_values();
    values.push(("/Link/VoltageSense", BusValue::Float(0.0)));
    add_device(&mut host, &bus, CHARGER, 1, None, &values, start);
    host.dispatch_replies(start);

    assert_eq!(bus.value(CHARGER, "/Link/VoltageSense"), Some(BusValue::Float(53.1)));
    assert_eq!(bus.value(CHARGER, "/Link/NetworkMode"), Some(BusValue::Int(NETWORK_MODE_HUB1)));
    assert_eq!(host.item(CONTROL_SENSE_PATH), Some(&BusValue::Int(1)));
}

#[test]
fn inverter_without_hub1_charge_voltage_gets_no_charger_writes() {
    let start = Instant::now();
    let bus = InMemoryBus::recording();
    let metrics = HostMetrics::new(new_registry()).expect("metrics register");
    let mut host = host(
        vec![Box::new(ChargerSynchronizer::new(
            Duration::from_secs(10),
            SupervisionHandle::new(),
        ))],
        &bus,
    )
    .with_metrics(metrics.clone());
    host.start(start);
    add_device(
        &mut host,
        &bus,
        VEBUS,
        0,
        None,
        &[("/State", BusValue::Int(3)), ("/Dc/0/Voltage", BusValue::Float(53.1))],
        start,
    );
    add_device(&mut host, &bus, CHARGER, 1, None, &charger_values(), start);
    turn(&mut host, secs(start, 10));
    turn(&mut host, secs(start, 20));

    assert!(bus.writes().is_empty());
    assert_eq!(host.item(CONTROL_VOLTAGE_PATH), Some(&BusValue::Int(0)));
    assert_eq!(metrics.delegate_failures("charger_sync", "on_timer"), 0);
    assert_eq!(metrics.delegate_failures("charger_sync", "on_device_added"), 0);
}

#[test]
fn failing_charger_does_not_block_the_others() {
    const SECOND: &str = "com.victronenergy.solarcharger.ttyO4";
    let start = Instant::now();
    let bus = InMemoryBus::recording();
    let metrics = HostMetrics::new(new_registry()).expect("metrics register");
    let mut host = host(
        vec![Box::new(ChargerSynchronizer::new(
            Duration::from_secs(10),
            SupervisionHandle::new(),
        ))],
        &bus,
    )
    .with_metrics(metrics.clone());
    host.start(start);
    hub1_inverter(&mut host, &bus, start);
    add_device(&mut host, &bus, CHARGER, 1, None, &charger_values(), start);
    bus.set_responsiveness(CHARGER, Responsiveness::Declining)
        .expect("charger registered");
    add_device(&mut host, &bus, SECOND, 2, None, &charger_values(), start);
    host.dispatch_replies(start);

    bus.clear_requests();
    turn(&mut host, secs(start, 10));

    let writes = bus.writes();
    assert!(writes.contains(&(CHARGER.to_owned(), "/Link/NetworkMode".to_owned(), BusValue::Int(NETWORK_MODE_HUB1))));
    assert!(writes.contains(&(SECOND.to_owned(), "/Link/NetworkMode".to_owned(), BusValue::Int(NETWORK_MODE_HUB1))));
    assert!(writes.contains(&(SECOND.to_owned(), "/Link/ChargeVoltage".to_owned(), BusValue::Float(55.2))));
    assert_eq!(bus.value(SECOND, "/Link/ChargeVoltage"), Some(BusValue::Float(55.2)));
    assert_eq!(bus.value(CHARGER, "/Link/NetworkMode"), Some(BusValue::Int(0)));
    assert_eq!(host.item(CONTROL_VOLTAGE_PATH), Some(&BusValue::Int(1)));
    assert_eq!(metrics.delegate_failures("charger_sync", "on_reply"), 0);
    assert_eq!(metrics.delegate_failures("charger_sync", "on_timer"), 0);
}
