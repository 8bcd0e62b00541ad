//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The controller's delegates and the standard set wired by the daemon.

pub mod buzzer;
pub mod charger_sync;
pub mod hub;
pub mod relay;
pub mod safety;
pub mod service_mapper;
pub mod soc_writer;
pub mod supervisor;

use syscalc_common::AppConfig;

use crate::delegate::Delegate;
use crate::process::ProcessKiller;

pub use buzzer::BuzzerActuator;
pub use charger_sync::ChargerSynchronizer;
pub use hub::{classify, HubClass, HubClassifier};
pub use relay::RelayActuator;
pub use safety::{SafetyMonitor, VoltageWindow};
pub use service_mapper::ServiceMapper;
pub use soc_writer::InverterSocWriter;
pub use supervisor::{ServiceSupervisor, SupervisionHandle};

/// Build every delegate from configuration, in dispatch order.
///
/// The supervisor and the charger synchronizer share one supervision table so
/// chargers are left alone while a liveness probe is outstanding.
pub fn standard_delegates(config: &AppConfig, killer: Box<dyn ProcessKiller>) -> Vec<Box<dyn Delegate>> {
    let supervision = SupervisionHandle::new();
    let mut delegates: Vec<Box<dyn Delegate>> = vec![
        Box::new(ServiceMapper::new()),
        Box::new(HubClassifier::new()),
    ];
    if config.supervisor.enabled {
        delegates.push(Box::new(ServiceSupervisor::new(
            &config.supervisor,
            supervision.clone(),
            killer,
        )));
    }
    delegates.push(Box::new(ChargerSynchronizer::new(
        config.charger_sync.interval,
        supervision,
    )));
    delegates.push(Box::new(InverterSocWriter::new()));
    delegates.push(Box::new(SafetyMonitor::new(config.safety.clone())));
    delegates.push(Box::new(RelayActuator::discover(
        &config.hardware.relays,
        config.hardware.relay_refresh,
    )));
    delegates.push(Box::new(BuzzerActuator::discover(
        &config.hardware.buzzer,
        config.hardware.buzzer_blink,
    )));
    delegates
}
