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
use tracing::{debug, info, warn};

use crate::context::DelegateContext;
use crate::delegate::{Delegate, OutputSpec, TimerToken, WriteOutcome};
use crate::hardware::{gpio_paths, HardwareFile};

pub const BUZZER_PATH: &str = "/Buzzer/State";

const BLINK_TIMER: TimerToken = TimerToken(1);

/// Drives the alarm buzzer. While `/Buzzer/State` is 1 the output toggles every
/// blink interval; the blink timer exists exactly while the state is 1.
pub struct BuzzerActuator {
    file: Option<HardwareFile>,
    blink: Duration,
    timer: Option<TimerHandle>,
    output_on: bool,
}

impl BuzzerActuator {
    /// Use the first GPIO directory in the buzzer list file, if any.
    pub fn discover(list_file: &Path, blink: Duration) -> Self {
        let file = gpio_paths(list_file)
            .first()
            .map(|dir| HardwareFile::in_gpio_dir(dir));
        match &file {
            Some(file) => info!(path = %file.path().display(), "gpio buzzer found"),
            None => info!(list = %list_file.display(), "no buzzer found"),
        }
        Self {
            file,
            blink,
            timer: None,
            output_on: false,
        }
    }

    pub fn is_present(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_blinking(&self) -> bool {
        self.timer.is_some()
    }

    fn set_output(&mut self, on: bool) {
        let Some(file) = &self.file else {
            return;
        };
        if let Err(err) = file.write_state(on) {
            warn!(error = %err, "buzzer write failed");
        }
        self.output_on = on;
    }

    fn stop_blinking(&mut self, ctx: &mut DelegateContext<'_>) {
        if let Some(timer) = self.timer.take() {
            ctx.cancel_timer(timer);
        }
        self.set_output(false);
    }
}

impl Delegate for BuzzerActuator {
    fn name(&self) -> &'static str {
        "buzzer"
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        if self.file.is_none() {
            return Vec::new();
        }
        vec![OutputSpec::new(BUZZER_PATH).writable()]
    }

    fn on_start(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        ctx.publish(BUZZER_PATH, Some(BusValue::Int(0)));
        // Silence whatever a previous run left behind.
        self.set_output(false);
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut DelegateContext<'_>) -> Result<()> {
        if self.file.is_some() {
            self.stop_blinking(ctx);
        }
        Ok(())
    }

    fn on_timer(
        &mut self,
        _token: TimerToken,
        _snapshot: &ValueSnapshot,
        _ctx: &mut DelegateContext<'_>,
    ) -> Result<TimerAction> {
        let next = !self.output_on;
        self.set_output(next);
        Ok(TimerAction::Continue)
    }

    fn on_write(
        &mut self,
        path: &str,
        value: &BusValue,
        ctx: &mut DelegateContext<'_>,
    ) -> Result<WriteOutcome> {
        if path != BUZZER_PATH || self.file.is_none() {
            return Ok(WriteOutcome::Rejected);
        }
        let Some(requested) = value.as_i64() else {
            warn!(%value, "incorrect value received on buzzer state");
            return Ok(WriteOutcome::Rejected);
        };
        let on = requested == 1;
        if on {
            if self.timer.is_none() {
                self.timer = Some(ctx.schedule_repeating(self.blink, BLINK_TIMER));
                self.set_output(true);
                debug!("buzzer blinking");
            }
        } else {
            self.stop_blinking(ctx);
            debug!("buzzer silenced");
        }
        ctx.publish(BUZZER_PATH, Some(BusValue::from(on)));
        Ok(WriteOutcome::Accepted)
    }
}
