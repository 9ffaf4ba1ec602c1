//! Simulated converter board
//!
//! Two threads stand in for the hardware. The trigger thread ticks at the
//! armed frequency. The conversion thread runs at raised priority and plays
//! the interrupt handler: it advances timer-triggered conversions on ticks,
//! completes immediate conversions straight away and reports a missed tick
//! when the trigger fires with no timer-triggered conversion loaded. Every
//! step it takes, including the call into the [`InterruptSink`], happens inside
//! one critical section, as it would with interrupts masked.

mod driver;
mod signal;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use adc_types::{AdcError, ChannelSet, ErrorCode, Sample};
use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thread_priority::ThreadPriority;

use crate::InterruptSink;
use driver::{HwEvent, HwState, Job, JobKind, SharedHw};
use signal::SignalGenerator;

pub use driver::SimDriver;

/// Error code reported for an injected conversion failure.
pub const SIM_CONVERSION_ERROR: ErrorCode = 0x51;

const IDLE_POLL: Duration = Duration::from_millis(50);

/// Behaviour of the simulated board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Probability that a conversion fails, 0.0 to 1.0
    #[serde(default)]
    pub error_rate: f64,
    /// Sine amplitude as a fraction of half scale
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    /// Sine frequency in Hz
    #[serde(default = "default_signal_hz")]
    pub signal_hz: f64,
    /// Uniform noise as a fraction of half scale
    #[serde(default = "default_noise")]
    pub noise: f64,
    /// Report timer-triggered conversions in two halves, like a DMA half-transfer interrupt
    #[serde(default)]
    pub half_complete: bool,
}

fn default_amplitude() -> f64 { 0.8 }
fn default_signal_hz() -> f64 { 10.0 }
fn default_noise() -> f64 { 0.02 }

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.0,
            amplitude: default_amplitude(),
            signal_hz: default_signal_hz(),
            noise: default_noise(),
            half_complete: false,
        }
    }
}

/// Builds a simulated board. The driver goes to the scheduler; the board is
/// then spawned with the scheduler as its interrupt sink.
pub fn sim_board(config: SimConfig) -> (SimDriver, SimBoard) {
    let hw: SharedHw = Arc::new(critical_section::Mutex::new(RefCell::new(HwState::default())));
    let (events_tx, events_rx) = flume::unbounded();
    let (arm_tx, arm_rx) = flume::bounded(1);
    let driver = SimDriver::new(Arc::clone(&hw), events_tx.clone(), arm_tx.clone());
    let board = SimBoard {
        config,
        hw,
        events_tx,
        events_rx,
        arm_tx,
        arm_rx,
    };
    (driver, board)
}

/// The simulated hardware, not yet running.
pub struct SimBoard {
    config: SimConfig,
    hw: SharedHw,
    events_tx: Sender<HwEvent>,
    events_rx: Receiver<HwEvent>,
    arm_tx: Sender<()>,
    arm_rx: Receiver<()>,
}

/// What the conversion thread does after inspecting the hardware state.
enum Action {
    Nothing,
    Complete { channels: ChannelSet, first: usize, n: usize },
    Error,
    Missed,
}

impl SimBoard {
    /// Starts the trigger and conversion threads, delivering interrupts to `sink`.
    pub fn spawn<H: InterruptSink>(self, sink: Arc<H>) -> Result<SimHandle, AdcError> {
        let running = Arc::new(AtomicBool::new(true));

        let trigger = {
            let hw = Arc::clone(&self.hw);
            let running = Arc::clone(&running);
            let events = self.events_tx.clone();
            let arm = self.arm_rx.clone();
            thread::Builder::new()
                .name("sim_trigger".into())
                .spawn(move || run_trigger(&hw, &events, &arm, &running))
                .map_err(|e| AdcError::HardwareError(format!("Failed to spawn trigger thread: {}", e)))?
        };

        let conversion = {
            let hw = Arc::clone(&self.hw);
            let running_flag = Arc::clone(&running);
            let events = self.events_rx.clone();
            let config = self.config.clone();
            let spawned = thread::Builder::new()
                .name("sim_conversion".into())
                .spawn(move || {
                    if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
                        warn!("Failed to set conversion thread priority: {:?}", e);
                    }
                    run_conversions(&hw, &events, &running_flag, &config, sink.as_ref());
                });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    running.store(false, Ordering::Release);
                    let _ = self.arm_tx.try_send(());
                    let _ = trigger.join();
                    return Err(AdcError::HardwareError(format!(
                        "Failed to spawn conversion thread: {}",
                        e
                    )));
                }
            }
        };

        info!(
            "Simulated board running (error rate {:.3}, half-complete {})",
            self.config.error_rate, self.config.half_complete
        );
        Ok(SimHandle {
            running,
            arm: self.arm_tx,
            threads: vec![trigger, conversion],
        })
    }
}

/// Running simulated board. Dropping it stops the board threads.
pub struct SimHandle {
    running: Arc<AtomicBool>,
    arm: Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl SimHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops and joins the board threads.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.arm.try_send(());
        for handle in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                error!("Simulated board thread panicked: {:?}", e);
            }
        }
        info!("Simulated board stopped");
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_trigger(hw: &SharedHw, events: &Sender<HwEvent>, arm: &Receiver<()>, running: &AtomicBool) {
    debug!("Trigger thread started");
    let mut next_tick: Option<Instant> = None;

    while running.load(Ordering::Acquire) {
        let frequency = critical_section::with(|cs| hw.borrow_ref(cs).trigger);
        let Some(frequency) = frequency.filter(|&f| f > 0) else {
            next_tick = None;
            match arm.recv_timeout(IDLE_POLL) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        let period = Duration::from_secs_f64(1.0 / f64::from(frequency));
        let at = next_tick.unwrap_or_else(|| Instant::now() + period);
        match arm.recv_deadline(at) {
            // Re-armed or stopped: restart the tick grid.
            Ok(()) => next_tick = None,
            Err(RecvTimeoutError::Timeout) => {
                if events.send(HwEvent::Tick).is_err() {
                    break;
                }
                let now = Instant::now();
                let mut next = at + period;
                if next <= now {
                    next = now + period;
                }
                next_tick = Some(next);
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Trigger thread exiting");
}

fn run_conversions<H: InterruptSink>(
    hw: &SharedHw,
    events: &Receiver<HwEvent>,
    running: &AtomicBool,
    config: &SimConfig,
    sink: &H,
) {
    info!("Conversion thread started");
    let generator = SignalGenerator::new(config);
    let error_rate = config.error_rate.clamp(0.0, 1.0);
    let mut rng = rand::thread_rng();
    let mut samples: Vec<Sample> = Vec::new();

    while running.load(Ordering::Acquire) {
        let event = match events.recv_timeout(IDLE_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        critical_section::with(|cs| {
            let action = {
                let mut state = hw.borrow_ref_mut(cs);
                step(&mut state, event, config.half_complete)
            };
            match action {
                Action::Nothing => {}
                Action::Missed => sink.timer_missed(),
                Action::Error => sink.conversion_error(SIM_CONVERSION_ERROR),
                Action::Complete { .. } if rng.gen_bool(error_rate) => {
                    // The failed conversion is gone; the scheduler loads a new one.
                    hw.borrow_ref_mut(cs).job = None;
                    sink.conversion_error(SIM_CONVERSION_ERROR);
                }
                Action::Complete { channels, first, n } => {
                    generator.fill(&mut rng, channels, first, &mut samples, n);
                    sink.conversion_complete(&samples);
                }
            }
        });
    }
    info!("Conversion thread shutting down");
}

/// Advances the hardware state for one event. Runs with the critical section held.
fn step(hw: &mut HwState, event: HwEvent, half_complete: bool) -> Action {
    match event {
        HwEvent::Tick => match hw.job {
            Some(Job { kind: JobKind::Triggered, .. }) => convert_tick(hw, half_complete),
            _ if hw.trigger.is_some() => Action::Missed,
            _ => Action::Nothing,
        },
        HwEvent::Kick(generation) if generation == hw.generation => match hw.job {
            Some(Job { kind: JobKind::Immediate, channels, count, .. }) => {
                hw.job = None;
                Action::Complete { channels, first: 0, n: count }
            }
            Some(Job { kind: JobKind::Triggered, fire_now: true, .. }) => {
                if let Some(job) = hw.job.as_mut() {
                    job.fire_now = false;
                }
                convert_tick(hw, half_complete)
            }
            _ => Action::Nothing,
        },
        HwEvent::Kick(_) => Action::Nothing,
    }
}

/// One trigger's worth of conversions on the loaded timer-triggered job.
fn convert_tick(hw: &mut HwState, half_complete: bool) -> Action {
    let Some(job) = hw.job.as_mut() else {
        return Action::Nothing;
    };
    if job.count == 0 {
        hw.job = None;
        return Action::Error;
    }
    job.converted = (job.converted + job.channels.count().max(1)).min(job.count);

    let first = job.reported;
    let channels = job.channels;
    if job.converted == job.count {
        let n = job.count - first;
        hw.job = None;
        Action::Complete { channels, first, n }
    } else if half_complete && job.reported == 0 && job.converted * 2 >= job.count {
        job.reported = job.converted;
        Action::Complete { channels, first, n: job.converted }
    } else {
        Action::Nothing
    }
}
