//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delegate host and device orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Single-threaded event loop around a [`DelegateHost`].
//!
//! Everything the host does happens on the task that awaits [`EventLoop::run`]; other
//! tasks talk to it through a [`LoopHandle`]. The loop must run on a current-thread
//! runtime or inside a `LocalSet` because delegates are not `Send`.

use std::future::Future;
use std::time::{Duration, Instant};

use syscalc_bus::{BusValue, Device, ValueSnapshot};
use syscalc_common::time::{duration_to_millis, lateness_ms};
use syscalc_rt::RateLimiter;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::delegate::WriteOutcome;
use crate::error::{HostError, Result};
use crate::host::DelegateHost;

/// Produces the value snapshot handed to the delegates on every tick.
pub type SnapshotSource = Box<dyn FnMut() -> ValueSnapshot>;

/// Input delivered to the loop from outside.
#[derive(Debug)]
pub enum LoopEvent {
    DeviceAdded {
        device: Device,
        snapshot: ValueSnapshot,
    },
    DeviceRemoved(Device),
    /// Run a tick with this snapshot right away.
    Snapshot(ValueSnapshot),
    Write {
        path: String,
        value: BusValue,
        respond: Option<oneshot::Sender<WriteOutcome>>,
    },
    /// Only drain bus replies.
    Wake,
}

/// Cloneable sender side of the loop.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl LoopHandle {
    pub fn send(&self, event: LoopEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| HostError::LoopClosed)
    }

    /// Announce a device. Service names outside the bus namespace are refused here.
    pub fn device_added(&self, service: &str, instance: u32, snapshot: ValueSnapshot) -> Result<()> {
        let device = Device::new(service, instance)?;
        self.send(LoopEvent::DeviceAdded { device, snapshot })
    }

    pub fn device_removed(&self, device: Device) -> Result<()> {
        self.send(LoopEvent::DeviceRemoved(device))
    }

    pub fn snapshot(&self, snapshot: ValueSnapshot) -> Result<()> {
        self.send(LoopEvent::Snapshot(snapshot))
    }

    pub fn wake(&self) -> Result<()> {
        self.send(LoopEvent::Wake)
    }

    /// Write an item and wait for the owning delegate's verdict.
    pub async fn write(&self, path: impl Into<String>, value: impl Into<BusValue>) -> Result<WriteOutcome> {
        let (respond, outcome) = oneshot::channel();
        self.send(LoopEvent::Write {
            path: path.into(),
            value: value.into(),
            respond: Some(respond),
        })?;
        outcome.await.map_err(|_| HostError::LoopClosed)
    }
}

/// Drives the host from ticks, timer deadlines and [`LoopEvent`]s until shutdown.
pub struct EventLoop {
    host: DelegateHost,
    source: Option<SnapshotSource>,
    tick_interval: Duration,
    tx: mpsc::UnboundedSender<LoopEvent>,
    rx: mpsc::UnboundedReceiver<LoopEvent>,
}

impl EventLoop {
    pub fn new(host: DelegateHost, tick_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            host,
            source: None,
            tick_interval,
            tx,
            rx,
        }
    }

    /// Tick from `source` every interval. Without a source only `Snapshot` events tick.
    pub fn with_source(mut self, source: SnapshotSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn host(&self) -> &DelegateHost {
        &self.host
    }

    /// Run until `shutdown` resolves, then stop every delegate and return the host.
    pub async fn run<F>(mut self, shutdown: F) -> DelegateHost
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = RateLimiter::new(self.tick_interval);
        info!(
            tick_ms = duration_to_millis(ticker.period()),
            "event loop started"
        );
        self.host.start(now());
        self.host.dispatch_replies(now());

        loop {
            let deadline = self.host.next_deadline();
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(event) = self.rx.recv() => self.handle_event(event),
                _ = wait_for(deadline) => {
                    let fired_at = now();
                    let fired = self.host.fire_timers(fired_at);
                    if let Some(deadline) = deadline {
                        trace!(fired, lateness_ms = lateness_ms(deadline, fired_at), "timers fired");
                    }
                }
                _ = ticker.tick() => {
                    if let Some(source) = self.source.as_mut() {
                        let snapshot = source();
                        self.host.tick(snapshot, now());
                    }
                }
            }
            self.host.dispatch_replies(now());
        }

        info!("event loop stopping");
        self.host.shutdown(now());
        self.host
    }

    fn handle_event(&mut self, event: LoopEvent) {
        let at = now();
        match event {
            LoopEvent::DeviceAdded { device, snapshot } => {
                self.host.device_added(&device, snapshot, at)
            }
            LoopEvent::DeviceRemoved(device) => self.host.device_removed(&device, at),
            LoopEvent::Snapshot(snapshot) => {
                self.host.tick(snapshot, at);
            }
            LoopEvent::Write {
                path,
                value,
                respond,
            } => {
                let outcome = self.host.write(&path, &value, at);
                if let Some(respond) = respond {
                    if respond.send(outcome).is_err() {
                        debug!(path = %path, "write requester went away");
                    }
                }
            }
            LoopEvent::Wake => {}
        }
    }
}

/// Loop time. Follows tokio's clock so paused-time tests stay consistent with timers.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
