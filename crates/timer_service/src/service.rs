use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use flume::{Receiver, Sender};
use log::{debug, error, info, warn};
use thread_priority::ThreadPriority;

use crate::config::TimerConfig;
use crate::error::TimerError;
use crate::list::{Poll, TimerList};
use crate::timer::Timer;

/// State shared between the service, its timers and the dispatcher thread.
pub(crate) struct Shared {
    list: Mutex<TimerList>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, TimerList> {
        // A panicking callback never holds the lock, so a poisoned list is still consistent.
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes the dispatcher. Never blocks: wakes coalesce in the single-slot channel.
    pub(crate) fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Owns the dispatcher thread that runs every [`Timer`] created from it.
pub struct TimerService {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Starts a dispatcher with the default [`TimerConfig`].
    pub fn new() -> Result<Self, TimerError> {
        Self::with_config(&TimerConfig::default())
    }

    pub fn with_config(config: &TimerConfig) -> Result<Self, TimerError> {
        let (wake_tx, wake_rx) = flume::bounded(1);
        let shared = Arc::new(Shared {
            list: Mutex::new(TimerList::default()),
            wake_tx,
            wake_rx,
            running: AtomicBool::new(true),
        });

        let thread_shared = Arc::clone(&shared);
        let high_priority = config.high_priority;
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .stack_size(config.stack_size)
            .spawn(move || {
                if high_priority {
                    if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
                        warn!("Failed to raise timer dispatcher priority: {:?}", e);
                    }
                }
                dispatch(&thread_shared);
            })?;

        info!("Timer service started on thread '{}'", config.thread_name);
        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// Creates an idle timer bound to this service.
    pub fn timer(&self) -> Timer {
        Timer::new(Arc::clone(&self.shared))
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Stops the dispatcher and waits for it to exit.
    ///
    /// A callback that is running finishes first. Timers created from this
    /// service stay valid but never fire again. Calling this from a timer
    /// callback detaches the dispatcher instead of joining it.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.wake();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!("Timer service shut down from its own dispatcher, detaching");
                return;
            }
            if handle.join().is_err() {
                error!("Timer dispatcher thread panicked");
            }
        }
        info!("Timer service stopped");
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Dispatcher loop: sleep until the earliest deadline or a wake, then fire
/// everything that is due, rescanning after each callback.
fn dispatch(shared: &Shared) {
    debug!("Timer dispatcher running");
    let mut next_wake: Option<Instant> = None;

    while shared.is_running() {
        // A timeout and a wake are handled the same way.
        let _ = match next_wake {
            Some(at) => shared.wake_rx.recv_deadline(at).is_ok(),
            None => shared.wake_rx.recv().is_ok(),
        };

        next_wake = loop {
            if !shared.is_running() {
                break None;
            }
            let polled = shared.lock().poll(Instant::now());
            match polled {
                Poll::Fire(callback) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                        error!("Timer callback panicked");
                    }
                }
                Poll::Wait(at) => break at,
            }
        };
    }
    debug!("Timer dispatcher exiting");
}
