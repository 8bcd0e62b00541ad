//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use syscalc_bus::{BusValue, ValueSnapshot};
use syscalc_rt::{TimerAction, TimerHandle};
use tracing::{info, warn};

use crate::context::DelegateContext;
use crate::delegate::{Delegate, OutputSpec, TimerToken, WriteOutcome};
use crate::hardware::{gpio_paths, HardwareFile};

const REFRESH_TIMER: TimerToken = TimerToken(1);

#[derive(Debug, Clone)]
struct RelayChannel {
    bus_path: String,
    file: HardwareFile,
}

/// Mirrors relay GPIO files onto writable `/Relay/{n}/State` items.
pub struct RelayActuator {
    channels: Vec<RelayChannel>,
    refresh: Duration,
    timer: Option<TimerHandle>,
}

impl RelayActuator {
    /// Discover relay channels from the GPIO list file.
    pub fn discover(list_file: &Path, refresh: Duration) -> Self {
        let channels: Vec<RelayChannel> = gpio_paths(list_file)
            .iter()
            .enumerate()
            .map(|(index, dir)| RelayChannel {
                bus_path: format!("/Relay/{}/State", index),
                file: HardwareFile::in_gpio_dir(dir),
            })
            .collect();
        if channels.is_empty() {
            info!(list = %list_file.display(), "no relays found");
        } else {
            let files: Vec<String> = channels
                .iter()
                .map(|channel| channel.file.path().display().to_string())
                .collect();
            info!(relays = %files.join(", "), "relays found");
        }
        Self {
            channels,
            refresh,
            timer: None,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn refresh_all(&self, ctx: &mut DelegateContext<'_>) {
        for channel in &self.channels {
            match channel.file.read_state() {
                Ok(state) => ctx.publish(&channel.bus_path, Some(BusValue::Int(state))),
                Err(err) => warn!(path = %channel.bus_path, error = %err, "relay state unreadable"),
            }
        }
    }
}

impl Delegate for RelayActuator {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        self.channels
            .iter()
            .map(|channel| OutputSpec::new(channel.bus_path.clone()).writable())
            .collect()
    }

    fn on_start(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        if self.channels.is_empty() {
            return Ok(());
        }
        self.refresh_all(ctx);
        self.timer = Some(ctx.schedule_repeating(self.refresh, REFRESH_TIMER));
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        if let Some(timer) = self.timer.take() {
            ctx.cancel_timer(timer);
        }
        Ok(())
    }

    fn on_timer(
        &mut self,
        _token: TimerToken,
        _snapshot: &ValueSnapshot,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<TimerAction> {
        self.refresh_all(ctx);
        Ok(TimerAction::Continue)
    }

    fn on_write(
        &mut self,
        path: &str,
        value: &BusValue,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<WriteOutcome> {
        let Some(channel) = self.channels.iter().find(|channel| channel.bus_path == path) else {
            return Ok(WriteOutcome::Rejected);
        };
        let Some(requested) = value.as_i64() else {
            warn!(path, %value, "relay state must be an integer");
            return Ok(WriteOutcome::Rejected);
        };
        let on = requested == 1;
        if let Err(err) = channel.file.write_state(on) {
            warn!(path, error = %err, "relay write failed");
            return Ok(WriteOutcome::Rejected);
        }
        ctx.publish(path, Some(BusValue::from(on)));
        Ok(WriteOutcome::Accepted)
    }
}
