//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use syscalc_bus::{BusReply, BusValue, Device, DeviceType, ValueSnapshot};
use syscalc_rt::TimerAction;

use crate::context::DelegateContext;

/// Output values a delegate wants published after a tick. `None` invalidates the item.
pub type OutputValues = BTreeMap<String, Option<BusValue>>;

/// Paths a delegate needs the bus monitor to track for one device type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSpec {
    pub kind: DeviceType,
    pub paths: Vec<&'static str>,
}

impl InputSpec {
    pub fn new(kind: DeviceType, paths: &[&'static str]) -> Self {
        Self {
            kind,
            paths: paths.to_vec(),
        }
    }
}

/// A bus item published by a delegate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSpec {
    pub path: String,
    /// Display hint, e.g. `"%s A"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'static str>,
    pub writable: bool,
}

impl OutputSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            format: None,
            writable: false,
        }
    }

    pub fn with_format(mut self, format: &'static str) -> Self {
        self.format = Some(format);
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }
}

/// A bounded integer setting owned by the settings store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingSpec {
    pub name: &'static str,
    pub path: &'static str,
    pub default: i64,
    pub min: i64,
    pub max: i64,
}

/// Static declaration of everything a delegate consumes and produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelegateDescriptor {
    pub name: &'static str,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub settings: Vec<SettingSpec>,
}

/// Delegate-local timer discriminator, echoed back on firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u32);

/// Routing key stored with every scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTarget {
    pub delegate: usize,
    pub token: TimerToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    Rejected,
}

/// Unit of monitoring or control logic driven by the [`crate::DelegateHost`].
///
/// Every callback runs on the host's loop and must return promptly. Bus calls go
/// through the context and complete later via [`Delegate::on_reply`]. An error
/// returned from any callback is logged by the host and never stops the other
/// delegates.
pub trait Delegate {
    fn name(&self) -> &'static str;

    fn inputs(&self) -> Vec<InputSpec> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        Vec::new()
    }

    fn settings(&self) -> Vec<SettingSpec> {
        Vec::new()
    }

    fn descriptor(&self) -> DelegateDescriptor {
        DelegateDescriptor {
            name: self.name(),
            inputs: self.inputs(),
            outputs: self.outputs(),
            settings: self.settings(),
        }
    }

    /// Called once after every descriptor has been registered.
    fn on_start(&mut self, _ctx: &mut DelegateContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called once at shutdown; must release every timer the delegate owns.
    fn on_stop(&mut self, _ctx: &mut DelegateContext<'_>) -> Result<()> {
        Ok(())
    }

    /// A device appeared. No tick is guaranteed to have run yet.
    fn on_device_added(
        &mut self,
        _device: &Device,
        _snapshot: &ValueSnapshot,
        _ctx: &mut DelegateContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_device_removed(&mut self, _device: &Device, _ctx: &mut DelegateContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_tick(
        &mut self,
        _snapshot: &ValueSnapshot,
        _ctx: &mut DelegateContext<'_>,
    ) -> Result<Option<OutputValues>> {
        Ok(None)
    }

    fn on_timer(
        &mut self,
        _token: TimerToken,
        _snapshot: &ValueSnapshot,
        _ctx: &mut DelegateContext<'_>,
    ) -> Result<TimerAction> {
        Ok(TimerAction::Stop)
    }

    fn on_reply(&mut self, _reply: &BusReply, _ctx: &mut DelegateContext<'_>) -> Result<()> {
        Ok(())
    }

    /// A client wrote to one of this delegate's writable outputs.
    fn on_write(
        &mut self,
        _path: &str,
        _value: &BusValue,
        _ctx: &mut DelegateContext<'_>,
    ) -> Result<WriteOutcome> {
        Ok(WriteOutcome::Rejected)
    }
}
