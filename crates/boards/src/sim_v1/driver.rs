use std::cell::RefCell;
use std::sync::Arc;

use adc_sched::AdcDriver;
use adc_types::ChannelSet;
use flume::Sender;

/// Hardware registers of the simulated converter, shared between the driver
/// and the board threads.
pub(crate) type SharedHw = Arc<critical_section::Mutex<RefCell<HwState>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    /// Advances one conversion per trigger tick.
    Triggered,
    Immediate,
}

/// The conversion the hardware is currently working on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Job {
    pub kind: JobKind,
    pub channels: ChannelSet,
    /// Samples requested
    pub count: usize,
    /// Samples converted so far
    pub converted: usize,
    /// Samples already reported through a partial completion
    pub reported: usize,
    pub fire_now: bool,
}

#[derive(Debug, Default)]
pub(crate) struct HwState {
    /// Armed trigger frequency in Hz
    pub trigger: Option<u32>,
    pub job: Option<Job>,
    /// Bumped whenever a new job is loaded, so stale kicks can be told apart.
    pub generation: u64,
}

/// Messages for the conversion thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HwEvent {
    /// The hardware trigger fired.
    Tick,
    /// Start the job with this generation without waiting for a tick.
    Kick(u64),
}

/// [`AdcDriver`] for the simulated board. Writes the shared hardware state and
/// pokes the board threads; never completes anything itself.
pub struct SimDriver {
    hw: SharedHw,
    events: Sender<HwEvent>,
    arm: Sender<()>,
}

impl SimDriver {
    pub(crate) fn new(hw: SharedHw, events: Sender<HwEvent>, arm: Sender<()>) -> Self {
        Self { hw, events, arm }
    }

    fn load(&mut self, job: Job) {
        let (generation, kick) = critical_section::with(|cs| {
            let mut hw = self.hw.borrow_ref_mut(cs);
            hw.generation = hw.generation.wrapping_add(1);
            hw.job = Some(job);
            (hw.generation, job.fire_now || job.kind == JobKind::Immediate)
        });
        if kick {
            let _ = self.events.try_send(HwEvent::Kick(generation));
        }
    }
}

impl AdcDriver for SimDriver {
    fn start_timer_conversion(&mut self, _channels: ChannelSet, frequency: u32) {
        critical_section::with(|cs| self.hw.borrow_ref_mut(cs).trigger = Some(frequency));
        let _ = self.arm.try_send(());
    }

    fn stop_timer_conversion(&mut self, _channels: ChannelSet) {
        critical_section::with(|cs| {
            let mut hw = self.hw.borrow_ref_mut(cs);
            hw.trigger = None;
            if matches!(hw.job, Some(Job { kind: JobKind::Triggered, .. })) {
                hw.job = None;
            }
        });
        let _ = self.arm.try_send(());
    }

    fn start_timer_triggered_conversion(&mut self, channels: ChannelSet, count: usize, fire_now: bool) {
        self.load(Job {
            kind: JobKind::Triggered,
            channels,
            count,
            converted: 0,
            reported: 0,
            fire_now,
        });
    }

    fn start_immediate_conversion(&mut self, channels: ChannelSet, count: usize) {
        self.load(Job {
            kind: JobKind::Immediate,
            channels,
            count,
            converted: 0,
            reported: 0,
            fire_now: false,
        });
    }
}
