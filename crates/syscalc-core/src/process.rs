//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ProcessError {
    #[error("refusing to signal pid {0}")]
    InvalidPid(u32),
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },
}

/// Forced termination of a hung service's process.
pub trait ProcessKiller {
    fn kill(&self, pid: u32) -> Result<(), ProcessError>;
}

/// Delivers `SIGKILL`. Pids 0 and 1 are never signalled.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalKiller;

impl ProcessKiller for SignalKiller {
    fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        let raw = i32::try_from(pid).map_err(|_| ProcessError::InvalidPid(pid))?;
        if raw <= 1 {
            return Err(ProcessError::InvalidPid(pid));
        }
        signal::kill(Pid::from_raw(raw), Signal::SIGKILL)
            .map_err(|source| ProcessError::Signal { pid, source })
    }
}
