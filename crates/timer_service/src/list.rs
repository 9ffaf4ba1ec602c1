//! The dispatcher's ordered timer list.
//!
//! Everything here runs under the service's list mutex, except the two flags
//! in [`TimerNode`], which interrupt-context code may set without the lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) type Callback = Arc<dyn Fn() + Send + Sync>;

/// Per-timer flags shared between a [`crate::Timer`] handle and its list entry.
#[derive(Debug, Default)]
pub(crate) struct TimerNode {
    pub scheduled: AtomicBool,
    pub jabbed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    At(Instant),
    /// Never expires; only a jab fires the timer.
    Infinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Repeat {
    Once,
    Every(Duration),
    /// Periodic with an infinite period: stays scheduled, fires once per jab.
    EveryJab,
}

struct Entry {
    node: Arc<TimerNode>,
    callback: Callback,
    deadline: Deadline,
    repeat: Repeat,
}

/// What the dispatcher should do next.
pub(crate) enum Poll {
    /// Run this callback outside the lock, then poll again.
    Fire(Callback),
    /// Nothing is due. Sleep until the instant, or until woken if `None`.
    Wait(Option<Instant>),
}

#[derive(Default)]
pub(crate) struct TimerList {
    entries: VecDeque<Entry>,
    /// Deadline the dispatcher is currently sleeping towards. `None` means it
    /// sleeps until woken.
    wait_until: Option<Instant>,
}

impl TimerList {
    /// Schedules `node`, replacing any existing entry for it.
    ///
    /// Returns true when the dispatcher has to be woken to honour the new deadline.
    pub fn insert(
        &mut self,
        node: Arc<TimerNode>,
        callback: Callback,
        deadline: Deadline,
        repeat: Repeat,
    ) -> bool {
        self.remove(&node);
        node.jabbed.store(false, Ordering::Release);
        node.scheduled.store(true, Ordering::Release);
        self.entries.push_back(Entry { node, callback, deadline, repeat });

        match (deadline, self.wait_until) {
            (Deadline::Infinite, _) => false,
            (Deadline::At(_), None) => true,
            (Deadline::At(at), Some(waiting)) => at < waiting,
        }
    }

    /// Unschedules `node`. Does nothing if it is idle.
    pub fn remove(&mut self, node: &Arc<TimerNode>) {
        self.entries.retain(|e| !Arc::ptr_eq(&e.node, node));
        node.scheduled.store(false, Ordering::Release);
        node.jabbed.store(false, Ordering::Release);
    }

    /// Finds the first jabbed or expired timer and advances or removes it.
    pub fn poll(&mut self, now: Instant) -> Poll {
        let due = self.entries.iter().position(|e| {
            e.node.jabbed.load(Ordering::Acquire)
                || matches!(e.deadline, Deadline::At(at) if at <= now)
        });

        if let Some(idx) = due {
            let entry = &mut self.entries[idx];
            let callback = Arc::clone(&entry.callback);
            entry.node.jabbed.store(false, Ordering::Release);
            let repeat = entry.repeat;
            match repeat {
                Repeat::Once => {
                    if let Some(entry) = self.entries.remove(idx) {
                        entry.node.scheduled.store(false, Ordering::Release);
                    }
                }
                Repeat::Every(period) => {
                    if let Deadline::At(at) = entry.deadline {
                        entry.deadline = Deadline::At(next_period(at, period, now));
                    }
                }
                Repeat::EveryJab => {}
            }
            return Poll::Fire(callback);
        }

        self.wait_until = self
            .entries
            .iter()
            .filter_map(|e| match e.deadline {
                Deadline::At(at) => Some(at),
                Deadline::Infinite => None,
            })
            .min();
        Poll::Wait(self.wait_until)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// First deadline on the `when + k * period` grid that lies strictly after `now`.
///
/// Elapsed periods are skipped rather than replayed, so a late dispatcher
/// fires a periodic timer once instead of in a burst.
fn next_period(when: Instant, period: Duration, now: Instant) -> Instant {
    if when > now {
        return when;
    }
    let elapsed = now.duration_since(when).as_nanos();
    let periods = elapsed / period.as_nanos().max(1) + 1;
    u32::try_from(periods)
        .ok()
        .and_then(|n| period.checked_mul(n))
        .and_then(|offset| when.checked_add(offset))
        .unwrap_or(now + period)
}
