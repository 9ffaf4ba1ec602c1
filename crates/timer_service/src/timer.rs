use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;

use crate::list::{Deadline, Repeat, TimerNode};
use crate::service::Shared;

/// When a started timer first fires, and for periodic timers how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Fire once on the next dispatcher pass. Never periodic.
    Immediate,
    After(Duration),
    /// Never expire. Only a jab fires the timer.
    Infinite,
}

impl Delay {
    /// Zero milliseconds means [`Delay::Immediate`].
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Delay::Immediate
        } else {
            Delay::After(Duration::from_millis(ms))
        }
    }

    fn resolve(self, periodic: bool, now: Instant) -> (Deadline, Repeat) {
        match self {
            Delay::Immediate => (Deadline::At(now), Repeat::Once),
            Delay::After(d) if d.is_zero() => (Deadline::At(now), Repeat::Once),
            Delay::After(d) => {
                let deadline = now
                    .checked_add(d)
                    .map_or(Deadline::Infinite, Deadline::At);
                (deadline, if periodic { Repeat::Every(d) } else { Repeat::Once })
            }
            Delay::Infinite => (
                Deadline::Infinite,
                if periodic { Repeat::EveryJab } else { Repeat::Once },
            ),
        }
    }
}

/// A software timer run by a [`crate::TimerService`] dispatcher.
///
/// The handle is cheap to share behind an `Arc`; every method takes `&self`.
/// Dropping it stops the timer.
pub struct Timer {
    node: Arc<TimerNode>,
    shared: Arc<Shared>,
}

impl Timer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            node: Arc::new(TimerNode::default()),
            shared,
        }
    }

    /// Schedules `callback`, replacing any earlier schedule of this timer.
    ///
    /// Safe to call from the timer's own callback.
    pub fn start<F>(&self, callback: F, periodic: bool, delay: Delay)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if !self.shared.is_running() {
            warn!("Timer started on a service that has shut down; it will not fire");
        }
        let (deadline, repeat) = delay.resolve(periodic, Instant::now());
        let wake = self.shared.lock().insert(
            Arc::clone(&self.node),
            Arc::new(callback),
            deadline,
            repeat,
        );
        if wake {
            self.shared.wake();
        }
    }

    /// Unschedules the timer. A callback already running is not interrupted.
    pub fn stop(&self) {
        self.shared.lock().remove(&self.node);
    }

    /// Fires the timer on the next dispatcher pass regardless of its deadline.
    pub fn jab(&self) {
        {
            let _list = self.shared.lock();
            if self.node.scheduled.load(Ordering::Acquire) {
                self.node.jabbed.store(true, Ordering::Release);
            }
        }
        self.shared.wake();
    }

    /// Like [`Timer::jab`], but only touches atomics and a `try_send` on the
    /// wake channel, whose internal lock is a spinlock held just for the push.
    /// Never parks, so it may be called from interrupt context.
    pub fn jab_from_interrupt(&self) {
        self.node.jabbed.store(true, Ordering::Release);
        self.shared.wake();
    }

    /// True while the timer is scheduled.
    pub fn is_active(&self) -> bool {
        self.node.scheduled.load(Ordering::Acquire)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("active", &self.is_active())
            .finish()
    }
}
