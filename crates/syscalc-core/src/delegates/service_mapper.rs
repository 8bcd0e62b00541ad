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
use syscalc_bus::{BusValue, Device, ValueSnapshot};

use crate::context::DelegateContext;
use crate::delegate::Delegate;

/// Publishes `/ServiceMapping/<type-and-instance>` = service name for every device.
#[derive(Debug, Default)]
pub struct ServiceMapper;

impl ServiceMapper {
    pub fn new() -> Self {
        Self
    }

    /// `com.victronenergy.battery.ttyO3` instance 3 maps to
    /// `/ServiceMapping/com_victronenergy_battery_3`.
    pub fn mapping_path(device: &Device) -> String {
        let sanitized = device.instance_name().replace(['.', '/'], "_");
        format!("/ServiceMapping/{}", sanitized)
    }
}

impl Delegate for ServiceMapper {
    fn name(&self) -> &'static str {
        "service_mapper"
    }

    fn on_device_added(
        &mut self,
        device: &Device,
        _snapshot: &ValueSnapshot,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<()> {
        ctx.publish(
            &Self::mapping_path(device),
            Some(BusValue::from(device.service())),
        );
        Ok(())
    }

    fn on_device_removed(&mut self, device: &Device, ctx: &mut DelegateContext<'_>) -> Result<()> {
        ctx.retract(&Self::mapping_path(device));
        Ok(())
    }
}
