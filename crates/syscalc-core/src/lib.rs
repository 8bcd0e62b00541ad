//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Delegate-based orchestration core of the system-calc controller.
//!
//! A [`DelegateHost`] owns a list of [`Delegate`]s and drives them from a single
//! logical thread: device lifecycle notifications, value-snapshot ticks, timer
//! firings and bus replies are all delivered in sequence. Delegates never block;
//! bus calls are submitted through their [`DelegateContext`] and answered later
//! through [`Delegate::on_reply`].

pub mod context;
pub mod delegate;
pub mod delegates;
pub mod error;
pub mod hardware;
pub mod host;
pub mod process;
pub mod runtime;
pub mod settings;

pub use context::DelegateContext;
pub use delegate::{
    Delegate, DelegateDescriptor, InputSpec, OutputSpec, OutputValues, SettingSpec, TimerTarget,
    TimerToken, WriteOutcome,
};
pub use error::HostError;
pub use host::DelegateHost;
pub use runtime::{EventLoop, LoopEvent, LoopHandle};
pub use settings::Settings;
