//! Notification sinks filled from interrupt context.

use std::cell::Cell;
use std::fmt;
use std::time::Duration;

use adc_types::HighSpeedResult;
use critical_section::Mutex;
use flume::{Receiver, Sender};

/// A counting semaphore built on a bounded token channel.
///
/// [`Semaphore::signal`] never blocks and saturates at the limit, so it is safe
/// to call from interrupt context. The token channel's internal lock is a
/// spinlock held only for the push itself, never across a wait. The waiting
/// side blocks in thread context.
#[derive(Debug)]
pub struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` tokens, at most `limit` (minimum 1).
    pub fn new(initial: usize, limit: usize) -> Self {
        let limit = limit.max(1);
        let (tx, rx) = flume::bounded(limit);
        for _ in 0..initial.min(limit) {
            let _ = tx.try_send(());
        }
        Self { tx, rx }
    }

    /// Blocks until a token is available and takes it.
    pub fn wait(&self) {
        // Both ends live in `self`, so the channel cannot disconnect.
        let _ = self.rx.recv();
    }

    /// Like [`Semaphore::wait`], giving up after `timeout`. Returns true if a token was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Takes a token if one is available.
    pub fn try_wait(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Returns a token. Does nothing if the semaphore is already at its limit.
    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn available(&self) -> usize {
        self.rx.len()
    }
}

/// The latest high-speed result.
///
/// Readers copy it out inside a critical section, which masks the interrupt
/// path for the duration of the copy, so a store never waits on a reader and
/// a reader never sees a half-written result.
pub struct EventRecord {
    last: Mutex<Cell<HighSpeedResult>>,
}

impl EventRecord {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Cell::new(HighSpeedResult::default())),
        }
    }

    /// The most recently stored result. `sequence == 0` means none yet.
    pub fn load(&self) -> HighSpeedResult {
        critical_section::with(|cs| self.last.borrow(cs).get())
    }

    pub(crate) fn store(&self, result: HighSpeedResult) {
        critical_section::with(|cs| self.last.borrow(cs).set(result));
    }
}

impl Default for EventRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord").field("last", &self.load()).finish()
    }
}
