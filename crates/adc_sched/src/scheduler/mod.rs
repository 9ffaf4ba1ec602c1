//! The conversion scheduler.

mod state;

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use adc_types::{
    AdcError, ChannelSet, ErrorCode, HighSpeedConfig, HighSpeedEvent, HighSpeedResult,
    LowSpeedResult, Sample, SchedulerConfig,
};
use flume::{Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use thiserror::Error;
use timer_service::{Delay, Timer, TimerService};

use crate::driver::AdcDriver;
use crate::sinks::{EventRecord, Semaphore};
use state::{LowSpeedCallback, State, Wake};

pub use state::{ConverterState, IsrCallback};

/// Why a non-blocking request was refused. The caller's buffer is handed back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Every low-speed slot is in use
    #[error("No free low-speed slot")]
    ResourceExhausted(Vec<Sample>),
    /// The request selected no channels
    #[error("Request selects no channels")]
    NoChannels(Vec<Sample>),
}

impl RequestError {
    pub fn into_buffer(self) -> Vec<Sample> {
        match self {
            RequestError::ResourceExhausted(buffer) | RequestError::NoChannels(buffer) => buffer,
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub converter: ConverterState,
    pub high_speed_active: bool,
    pub high_speed_error: bool,
    pub using_timer_service: bool,
    /// Samples left before the high-speed write cursor wraps
    pub remaining: usize,
    pub write_pos: usize,
    pub active_slots: usize,
}

/// Arbitrates one converter between the high-speed stream and up to
/// `max_low_speed` low-speed requests.
///
/// Create it with [`AdcScheduler::new`], hand a clone of the `Arc` to whatever
/// delivers the driver's interrupts, then configure the stream with
/// [`AdcScheduler::init`] and arm it with [`AdcScheduler::start`].
pub struct AdcScheduler<D: AdcDriver> {
    state: critical_section::Mutex<RefCell<State<D>>>,
    pool: Semaphore,
    slot_count: usize,
    /// Runs finished low-speed callbacks. Jabbed from interrupt context.
    low_speed_timer: Timer,
    /// Forwards high-speed events to listeners. Jabbed from interrupt context.
    high_speed_timer: Timer,
    timer_lock: Mutex<()>,
    listeners: Mutex<Vec<Sender<HighSpeedEvent>>>,
    listener_queue: usize,
    forwarded: AtomicU64,
    me: Weak<Self>,
}

impl<D: AdcDriver> AdcScheduler<D> {
    pub fn new(
        driver: D,
        timers: &TimerService,
        config: &SchedulerConfig,
    ) -> Result<Arc<Self>, AdcError> {
        if config.max_low_speed == 0 {
            return Err(AdcError::ConfigurationError(
                "max_low_speed must be at least 1".to_string(),
            ));
        }
        if config.listener_queue == 0 {
            return Err(AdcError::ConfigurationError(
                "listener_queue must be at least 1".to_string(),
            ));
        }
        if !timers.is_running() {
            return Err(AdcError::TimerError("timer service has shut down".to_string()));
        }

        info!("ADC scheduler created with {} low-speed slots", config.max_low_speed);
        Ok(Arc::new_cyclic(|me| Self {
            state: critical_section::Mutex::new(RefCell::new(State::new(
                driver,
                config.max_low_speed,
            ))),
            pool: Semaphore::new(config.max_low_speed, config.max_low_speed),
            slot_count: config.max_low_speed,
            low_speed_timer: timers.timer(),
            high_speed_timer: timers.timer(),
            timer_lock: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            listener_queue: config.listener_queue,
            forwarded: AtomicU64::new(0),
            me: me.clone(),
        }))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State<D>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    fn lock_timers(&self) -> MutexGuard<'_, ()> {
        self.timer_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<Sender<HighSpeedEvent>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- High-speed stream ----

    /// Configures the high-speed stream without starting it.
    ///
    /// A running stream is stopped first. Notification sinks, the interrupt
    /// callback and all listeners are cleared. `buffer` becomes the circular
    /// sample buffer; its length should be a multiple of `samples_per_event`,
    /// which in turn should be a multiple of the channel count.
    pub fn init(
        &self,
        channels: ChannelSet,
        frequency: u32,
        buffer: Vec<Sample>,
        samples_per_event: usize,
    ) -> Result<(), AdcError> {
        if buffer.is_empty() {
            return Err(AdcError::ConfigurationError("high-speed buffer is empty".to_string()));
        }
        if samples_per_event == 0 {
            return Err(AdcError::ConfigurationError(
                "samples_per_event must be at least 1".to_string(),
            ));
        }
        if channels.is_empty() {
            return Err(AdcError::ConfigurationError("no high-speed channels selected".to_string()));
        }
        if frequency == 0 {
            return Err(AdcError::ConfigurationError("frequency must be non-zero".to_string()));
        }
        if buffer.len() % samples_per_event != 0 || samples_per_event % channels.count() != 0 {
            warn!(
                "Buffer of {} samples, {} per event on {} channels will produce uneven events",
                buffer.len(),
                samples_per_event,
                channels.count()
            );
        }

        let len = buffer.len();
        {
            // `listen` must not run between the state reset and the timer stop.
            let _timers = self.lock_timers();
            let displaced = self.with_state(|s| s.reconfigure(channels, frequency, buffer, samples_per_event));
            drop(displaced);
            self.lock_listeners().clear();
            self.high_speed_timer.stop();
        }
        self.forwarded.store(0, Ordering::Release);

        info!(
            "High-speed stream configured: channels {} at {} Hz, {} samples, {} per event",
            channels, frequency, len, samples_per_event
        );
        Ok(())
    }

    /// [`AdcScheduler::init`] with a freshly allocated buffer.
    pub fn init_from_config(&self, config: &HighSpeedConfig) -> Result<(), AdcError> {
        self.init(
            config.channels,
            config.frequency,
            vec![0; config.buffer_len],
            config.samples_per_event,
        )
    }

    /// Arms the hardware trigger. Does nothing if the stream is already running.
    pub fn start(&self) -> Result<(), AdcError> {
        let started = self.with_state(|s| {
            if !s.hs.is_configured() {
                return Err(AdcError::NotConfigured);
            }
            let was_active = s.hs.active;
            s.start_high_speed_stream();
            Ok(!was_active)
        })?;
        if started {
            info!("High-speed stream started");
        }
        Ok(())
    }

    /// Disarms the hardware trigger. Does nothing if the stream is not running.
    pub fn stop(&self) {
        let stopped = self.with_state(|s| {
            let was_active = s.hs.active;
            s.stop_high_speed_stream();
            was_active
        });
        if stopped {
            info!("High-speed stream stopped");
        }
    }

    /// Swaps both notification sinks at once. Pass `None` to clear one.
    pub fn set_notification_sink(
        &self,
        semaphore: Option<Arc<Semaphore>>,
        record: Option<Arc<EventRecord>>,
    ) {
        let old = self.with_state(|s| {
            (
                std::mem::replace(&mut s.hs.semaphore, semaphore),
                std::mem::replace(&mut s.hs.record, record),
            )
        });
        drop(old);
    }

    /// Installs a function called in interrupt context with every batch of new
    /// high-speed samples. It must not call back into the scheduler.
    pub fn set_isr_callback(&self, callback: Option<IsrCallback>) {
        self.with_state(|s| s.hs.isr_fn = callback);
    }

    /// Subscribes to high-speed events in thread context.
    ///
    /// Events are forwarded by the timer service. A listener that falls behind
    /// misses events rather than stalling the others; compare
    /// [`HighSpeedResult::sequence`] to detect gaps. Dropping the receiver
    /// unsubscribes.
    pub fn listen(&self) -> Receiver<HighSpeedEvent> {
        let (tx, rx) = flume::bounded(self.listener_queue);
        let _timers = self.lock_timers();
        self.lock_listeners().push(tx);

        if !self.high_speed_timer.is_active() {
            let me = self.me.clone();
            self.high_speed_timer.start(
                move || {
                    if let Some(scheduler) = me.upgrade() {
                        scheduler.forward_high_speed();
                    }
                },
                true,
                Delay::Infinite,
            );
            self.with_state(|s| s.hs.uses_timer = true);
            debug!("High-speed listener timer started");
        }
        rx
    }

    fn forward_high_speed(&self) {
        let (result, samples) = self.with_state(|s| (s.hs.last, s.hs.samples(&s.hs.last).to_vec()));
        if result.sequence == 0 || self.forwarded.swap(result.sequence, Ordering::AcqRel) == result.sequence {
            return;
        }
        let event = HighSpeedEvent {
            result,
            samples: samples.into(),
        };

        let _timers = self.lock_timers();
        let mut listeners = self.lock_listeners();
        listeners.retain(|tx| !matches!(tx.try_send(event.clone()), Err(TrySendError::Disconnected(_))));
        if listeners.is_empty() {
            self.high_speed_timer.stop();
            self.with_state(|s| s.hs.uses_timer = false);
            debug!("Last high-speed listener gone, timer stopped");
        }
    }

    /// The most recent high-speed result. `sequence == 0` means none since init.
    pub fn last_result(&self) -> HighSpeedResult {
        self.with_state(|s| s.hs.last)
    }

    /// Copies the samples of `result` out of the circular buffer into `out`.
    /// Returns the number of samples copied.
    ///
    /// The buffer is overwritten as the stream advances, so this is only
    /// meaningful for a recent result.
    pub fn read_high_speed(&self, result: &HighSpeedResult, out: &mut [Sample]) -> usize {
        self.with_state(|s| {
            let samples = s.hs.samples(result);
            let n = samples.len().min(out.len());
            out[..n].copy_from_slice(&samples[..n]);
            n
        })
    }

    // ---- Low-speed requests ----

    /// Queues a one-off conversion of `channels` without blocking.
    ///
    /// `buffer` is resized to one sample per channel, filled, and handed to
    /// `callback` on the timer service thread.
    pub fn request_async<F>(
        &self,
        channels: ChannelSet,
        buffer: Vec<Sample>,
        callback: F,
    ) -> Result<(), RequestError>
    where
        F: FnOnce(LowSpeedResult) + Send + 'static,
    {
        if channels.is_empty() {
            return Err(RequestError::NoChannels(buffer));
        }
        if !self.pool.try_wait() {
            debug!("Low-speed request for {} refused: pool exhausted", channels);
            return Err(RequestError::ResourceExhausted(buffer));
        }
        self.submit(channels, buffer, Box::new(callback))
    }

    /// Converts `channels` and waits for the result, first waiting for a free
    /// slot if the pool is exhausted.
    ///
    /// Must not be called from a timer callback: the result is delivered by
    /// the same dispatcher thread.
    pub fn request_blocking(
        &self,
        channels: ChannelSet,
        buffer: Vec<Sample>,
    ) -> Result<LowSpeedResult, AdcError> {
        if channels.is_empty() {
            return Err(AdcError::ConfigurationError("request selects no channels".to_string()));
        }
        self.pool.wait();

        let (tx, rx) = flume::bounded(1);
        self.submit(
            channels,
            buffer,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .map_err(|_| AdcError::ShutDown)?;
        rx.recv().map_err(|_| AdcError::ShutDown)
    }

    /// Places a request holding a pool token into a slot.
    fn submit(
        &self,
        channels: ChannelSet,
        mut buffer: Vec<Sample>,
        callback: LowSpeedCallback,
    ) -> Result<(), RequestError> {
        buffer.resize(channels.count(), 0);
        self.ensure_housekeeping();

        let claimed = self.with_state(|s| {
            let claimed = s.claim(channels, buffer, callback);
            if claimed.is_ok() {
                s.kick();
            }
            claimed
        });
        match claimed {
            Ok(idx) => {
                debug!("Low-speed request for {} placed in slot {}", channels, idx);
                Ok(())
            }
            Err((buffer, _callback)) => {
                warn!("Slot pool out of step with its semaphore; refusing request");
                self.pool.signal();
                Err(RequestError::ResourceExhausted(buffer))
            }
        }
    }

    fn ensure_housekeeping(&self) {
        let _timers = self.lock_timers();
        if self.low_speed_timer.is_active() {
            return;
        }
        let me = self.me.clone();
        self.low_speed_timer.start(
            move || {
                if let Some(scheduler) = me.upgrade() {
                    scheduler.dispatch_low_speed();
                }
            },
            true,
            Delay::Infinite,
        );
        debug!("Low-speed housekeeping timer started");
    }

    /// Frees finished slots and runs their callbacks.
    fn dispatch_low_speed(&self) {
        for idx in 0..self.slot_count {
            let finished = self.with_state(|s| s.take_finished(idx));
            if let Some((callback, result)) = finished {
                if result.errored {
                    debug!("Low-speed slot {} completed after conversion errors", idx);
                }
                self.pool.signal();
                callback(result);
            }
        }
    }

    /// Number of low-speed requests that can be accepted right now.
    pub fn free_slots(&self) -> usize {
        self.pool.available()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.with_state(|s| SchedulerStatus {
            converter: s.converter,
            high_speed_active: s.hs.active,
            high_speed_error: s.hs.error,
            using_timer_service: s.hs.uses_timer,
            remaining: s.hs.remaining,
            write_pos: s.hs.write_pos,
            active_slots: s.active_slots(),
        })
    }

    // ---- Interrupt entry points ----

    /// Driver report: the current conversion finished with `samples`.
    pub fn on_conversion_complete(&self, samples: &[Sample]) {
        let wake = self.with_state(|s| s.complete(samples));
        self.wake(wake);
    }

    /// Driver report: the current conversion failed. The work is retried.
    pub fn on_conversion_error(&self, _code: ErrorCode) {
        self.with_state(|s| s.fail());
    }

    /// Driver report: the trigger fired while the converter was busy.
    pub fn on_timer_missed(&self) {
        self.with_state(|s| s.timer_missed());
    }

    fn wake(&self, wake: Wake) {
        if wake.low_speed {
            self.low_speed_timer.jab_from_interrupt();
        }
        if wake.high_speed {
            self.high_speed_timer.jab_from_interrupt();
        }
    }
}

impl<D: AdcDriver> Drop for AdcScheduler<D> {
    fn drop(&mut self) {
        self.with_state(|s| s.stop_high_speed_stream());
        debug!("ADC scheduler dropped");
    }
}

#[cfg(test)]
mod tests;
