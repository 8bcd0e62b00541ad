//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus data model and client boundary."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use crate::device::DeviceType;
use crate::value::BusValue;

/// Values of every monitored service at one instant, plus system-level values.
///
/// A path that is known but currently invalid is simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueSnapshot {
    services: BTreeMap<String, BTreeMap<String, BusValue>>,
    system: BTreeMap<String, BusValue>,
}

impl ValueSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service with no values yet.
    pub fn with_service(mut self, service: &str) -> Self {
        self.insert_service(service);
        self
    }

    pub fn with_value(mut self, service: &str, path: &str, value: impl Into<BusValue>) -> Self {
        self.insert(service, path, value.into());
        self
    }

    pub fn with_system(mut self, path: &str, value: impl Into<BusValue>) -> Self {
        self.insert_system(path, value.into());
        self
    }

    pub fn insert_service(&mut self, service: &str) {
        self.services.entry(service.to_owned()).or_default();
    }

    pub fn insert(&mut self, service: &str, path: &str, value: BusValue) {
        self.services
            .entry(service.to_owned())
            .or_default()
            .insert(path.to_owned(), value);
    }

    pub fn insert_system(&mut self, path: &str, value: BusValue) {
        self.system.insert(path.to_owned(), value);
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn get(&self, service: &str, path: &str) -> Option<&BusValue> {
        self.services.get(service)?.get(path)
    }

    pub fn get_f64(&self, service: &str, path: &str) -> Option<f64> {
        self.get(service, path).and_then(BusValue::as_f64)
    }

    pub fn get_i64(&self, service: &str, path: &str) -> Option<i64> {
        self.get(service, path).and_then(BusValue::as_i64)
    }

    pub fn contains(&self, service: &str, path: &str) -> bool {
        self.get(service, path).is_some()
    }

    pub fn system(&self, path: &str) -> Option<&BusValue> {
        self.system.get(path)
    }

    pub fn system_f64(&self, path: &str) -> Option<f64> {
        self.system(path).and_then(BusValue::as_f64)
    }

    /// Service names of the given type, in name order.
    pub fn services<'a>(&'a self, kind: &'a DeviceType) -> impl Iterator<Item = &'a str> + 'a {
        self.services
            .keys()
            .filter(move |service| DeviceType::from_service(service).ok().as_ref() == Some(kind))
            .map(String::as_str)
    }

    /// The inverter in control: the one named by system `/VebusService` if monitored,
    /// otherwise the first inverter service present.
    pub fn inverter_service(&self) -> Option<&str> {
        if let Some(name) = self.system("/VebusService").and_then(BusValue::as_str) {
            if let Some((service, _)) = self.services.get_key_value(name) {
                return Some(service.as_str());
            }
        }
        self.services(&DeviceType::Inverter).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VEBUS: &str = "com.victronenergy.vebus.ttyO1";

    #[test]
    fn inverter_prefers_system_selection() {
        let snapshot = ValueSnapshot::new()
            .with_service("com.victronenergy.vebus.ttyO0")
            .with_value(VEBUS, "/State", 3)
            .with_system("/VebusService", VEBUS);
        assert_eq!(snapshot.inverter_service(), Some(VEBUS));

        let fallback = ValueSnapshot::new().with_service(VEBUS);
        assert_eq!(fallback.inverter_service(), Some(VEBUS));
        assert_eq!(ValueSnapshot::new().inverter_service(), None);
    }

    #[test]
    fn services_filter_by_type() {
        let snapshot = ValueSnapshot::new()
            .with_service("com.victronenergy.solarcharger.ttyO2")
            .with_service("com.victronenergy.battery.ttyO3")
            .with_service("com.victronenergy.solarcharger.ttyO4");
        let chargers: Vec<_> = snapshot.services(&DeviceType::SolarCharger).collect();
        assert_eq!(
            chargers,
            vec!["com.victronenergy.solarcharger.ttyO2", "com.victronenergy.solarcharger.ttyO4"]
        );
    }
}
