//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the delegate host."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Deadline bookkeeping for repeating and one-shot timers.
//!
//! The service never sleeps and never invokes callbacks itself. The owner asks for
//! [`TimerService::next_deadline`], waits on its own loop, then drains expired timers
//! with [`TimerService::pop_due`] and reports each callback result through
//! [`TimerService::complete`]. Because firing is split in two, a callback may freely
//! schedule or cancel timers (including its own) while it runs.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use tracing::trace;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Result of a timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Keep a repeating timer scheduled.
    Continue,
    /// Remove the timer.
    Stop,
}

/// Opaque identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// A timer whose deadline has passed and whose callback is now in flight.
#[derive(Debug, Clone)]
pub struct DueTimer<T> {
    pub handle: TimerHandle,
    pub payload: T,
    pub scheduled_for: Instant,
}

#[derive(Debug)]
struct Entry<T> {
    payload: T,
    interval: Option<Duration>,
    due: Instant,
    in_flight: bool,
}

/// Timer table keyed by deadline. `T` is whatever the owner needs to route a firing.
#[derive(Debug)]
pub struct TimerService<T> {
    next_id: u64,
    entries: HashMap<u64, Entry<T>>,
    queue: BTreeSet<(Instant, u64)>,
}

impl<T> Default for TimerService<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
            queue: BTreeSet::new(),
        }
    }
}

impl<T: Clone> TimerService<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `payload` to fire every `interval`, first at `now + interval`.
    pub fn schedule_repeating(&mut self, now: Instant, interval: Duration, payload: T) -> TimerHandle {
        let interval = interval.max(MIN_INTERVAL);
        self.insert(now + interval, Some(interval), payload)
    }

    /// Schedule `payload` to fire once at `now + delay`.
    pub fn schedule_once(&mut self, now: Instant, delay: Duration, payload: T) -> TimerHandle {
        self.insert(now + delay, None, payload)
    }

    fn insert(&mut self, due: Instant, interval: Option<Duration>, payload: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                payload,
                interval,
                due,
                in_flight: false,
            },
        );
        self.queue.insert((due, id));
        TimerHandle(id)
    }

    /// Cancel a timer. Returns `false` when the handle is unknown or already gone.
    ///
    /// Cancelling a timer whose callback is in flight prevents its rescheduling.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.entries.remove(&handle.0) {
            Some(entry) => {
                if !entry.in_flight {
                    self.queue.remove(&(entry.due, handle.0));
                }
                trace!(timer = %handle, "timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    /// Number of live timers, in-flight callbacks included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().next().map(|(due, _)| *due)
    }

    /// Take the earliest timer due at or before `now`, marking it in flight.
    pub fn pop_due(&mut self, now: Instant) -> Option<DueTimer<T>> {
        let (due, id) = *self.queue.iter().next()?;
        if due > now {
            return None;
        }
        self.queue.remove(&(due, id));
        let entry = self.entries.get_mut(&id)?;
        entry.in_flight = true;
        Some(DueTimer {
            handle: TimerHandle(id),
            payload: entry.payload.clone(),
            scheduled_for: due,
        })
    }

    /// Record the callback result of a timer obtained from [`Self::pop_due`].
    ///
    /// Returns `true` when the timer was rescheduled. A repeating timer that fell behind
    /// is realigned to `now + interval` instead of firing a burst of catch-up calls.
    pub fn complete(&mut self, handle: TimerHandle, action: TimerAction, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(&handle.0) else {
            return false;
        };
        if !entry.in_flight {
            return false;
        }
        match (entry.interval, action) {
            (Some(interval), TimerAction::Continue) => {
                let mut next = entry.due + interval;
                if next <= now {
                    next = now + interval;
                }
                entry.due = next;
                entry.in_flight = false;
                self.queue.insert((next, handle.0));
                true
            }
            _ => {
                self.entries.remove(&handle.0);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_is_removed_after_completion() {
        let start = Instant::now();
        let mut timers = TimerService::new();
        let handle = timers.schedule_once(start, Duration::from_millis(10), "once");
        assert!(timers.pop_due(start).is_none());

        let due = timers.pop_due(start + Duration::from_millis(10)).expect("due");
        assert_eq!(due.handle, handle);
        assert!(!timers.complete(handle, TimerAction::Continue, start));
        assert!(timers.is_empty());
    }

    #[test]
    fn lagging_repeating_timer_is_realigned() {
        let start = Instant::now();
        let mut timers = TimerService::new();
        let handle = timers.schedule_repeating(start, Duration::from_secs(1), ());
        let late = start + Duration::from_secs(5);
        timers.pop_due(late).expect("due");
        assert!(timers.complete(handle, TimerAction::Continue, late));
        assert_eq!(timers.next_deadline(), Some(late + Duration::from_secs(1)));
        assert!(timers.pop_due(late).is_none());
    }
}
