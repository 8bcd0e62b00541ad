//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the delegate host."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Timer bookkeeping and loop pacing for the controller runtime.

pub mod scheduling;
pub mod timers;

pub use scheduling::RateLimiter;
pub use timers::{DueTimer, TimerAction, TimerHandle, TimerService};
