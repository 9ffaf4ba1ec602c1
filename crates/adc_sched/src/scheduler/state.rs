//! Scheduler state and the per-completion decision logic.
//!
//! Everything in this module runs with the critical section held, from
//! interrupt context as well as from threads. Nothing here blocks, allocates,
//! frees or logs.

use std::mem;
use std::sync::Arc;

use adc_types::{ChannelSet, HighSpeedResult, LowSpeedResult, ResultFlags, Sample};

use crate::driver::AdcDriver;
use crate::sinks::{EventRecord, Semaphore};

pub(crate) type LowSpeedCallback = Box<dyn FnOnce(LowSpeedResult) + Send>;

/// Plain function run in interrupt context with each batch of new high-speed samples.
pub type IsrCallback = fn(&[Sample]);

/// What the converter is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterState {
    Idle,
    HighSpeed,
    /// Converting for the low-speed slot with this index.
    LowSpeed(usize),
}

/// Timers to jab once the critical section is released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Wake {
    pub low_speed: bool,
    pub high_speed: bool,
}

#[derive(Default)]
pub(crate) struct LowSpeedSlot {
    channels: ChannelSet,
    buffer: Vec<Sample>,
    callback: Option<LowSpeedCallback>,
    active: bool,
    done: bool,
    errored: bool,
}

impl LowSpeedSlot {
    fn is_pending(&self) -> bool {
        self.active && !self.done
    }
}

pub(crate) struct HighSpeedDevice {
    pub channels: ChannelSet,
    pub frequency: u32,
    pub buffer: Vec<Sample>,
    pub samples_per_event: usize,
    pub write_pos: usize,
    /// Samples left before the write cursor wraps. Always `buffer.len() - write_pos`.
    pub remaining: usize,
    /// Samples still outstanding in the chunk last requested from the driver.
    pub chunk_left: usize,
    pub active: bool,
    /// A conversion error happened since the last reported event.
    pub error: bool,
    /// A trigger tick was lost since the last reported event.
    pub lost: bool,
    pub uses_timer: bool,
    pub last: HighSpeedResult,
    pub semaphore: Option<Arc<Semaphore>>,
    pub record: Option<Arc<EventRecord>>,
    pub isr_fn: Option<IsrCallback>,
}

impl HighSpeedDevice {
    fn unconfigured() -> Self {
        Self {
            channels: ChannelSet::EMPTY,
            frequency: 0,
            buffer: Vec::new(),
            samples_per_event: 0,
            write_pos: 0,
            remaining: 0,
            chunk_left: 0,
            active: false,
            error: false,
            lost: false,
            uses_timer: false,
            last: HighSpeedResult::default(),
            semaphore: None,
            record: None,
            isr_fn: None,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.buffer.is_empty() && self.samples_per_event > 0
    }

    /// The samples `result` refers to, if it still lies inside the buffer.
    pub fn samples(&self, result: &HighSpeedResult) -> &[Sample] {
        let end = result.offset.saturating_add(result.count);
        self.buffer.get(result.offset..end).unwrap_or(&[])
    }
}

/// Whatever a reconfiguration displaced, dropped by the caller outside the critical section.
pub(crate) struct Displaced {
    _buffer: Vec<Sample>,
    _semaphore: Option<Arc<Semaphore>>,
    _record: Option<Arc<EventRecord>>,
}

pub(crate) struct State<D> {
    pub driver: D,
    pub hs: HighSpeedDevice,
    pub slots: Vec<LowSpeedSlot>,
    pub converter: ConverterState,
    /// The trigger fired while the converter was busy; the next high-speed
    /// conversion has to start immediately.
    pub timer_missed: bool,
}

impl<D: AdcDriver> State<D> {
    pub fn new(driver: D, slot_count: usize) -> Self {
        Self {
            driver,
            hs: HighSpeedDevice::unconfigured(),
            slots: (0..slot_count).map(|_| LowSpeedSlot::default()).collect(),
            converter: ConverterState::Idle,
            timer_missed: false,
        }
    }

    /// Picks the next conversion and starts it.
    ///
    /// The scan starts just past the low-speed slot serviced last, or at slot 0
    /// after a high-speed conversion. Pending slots after the cursor go first,
    /// then the high-speed stream if it is armed. Only when the stream is not
    /// armed does the scan wrap to the slots before the cursor.
    pub fn schedule_next(&mut self) {
        let n = self.slots.len();
        let start = match self.converter {
            ConverterState::LowSpeed(idx) => idx + 1,
            _ => 0,
        };

        if let Some(idx) = self.find_pending(start, n) {
            self.start_low_speed(idx);
        } else if self.hs.active {
            self.start_high_speed();
        } else if let Some(idx) = self.find_pending(0, start.min(n)) {
            self.start_low_speed(idx);
        } else {
            self.converter = ConverterState::Idle;
        }
    }

    /// Takes a scheduling decision only if the converter is idle.
    pub fn kick(&mut self) {
        if self.converter == ConverterState::Idle {
            self.schedule_next();
        }
    }

    fn find_pending(&self, from: usize, to: usize) -> Option<usize> {
        (from..to).find(|&i| self.slots[i].is_pending())
    }

    fn start_low_speed(&mut self, idx: usize) {
        let channels = self.slots[idx].channels;
        self.converter = ConverterState::LowSpeed(idx);
        self.driver.start_immediate_conversion(channels, channels.count());
    }

    fn start_high_speed(&mut self) {
        let fire_now = mem::take(&mut self.timer_missed);
        self.converter = ConverterState::HighSpeed;
        self.driver
            .start_timer_triggered_conversion(self.hs.channels, self.hs.chunk_left, fire_now);
    }

    /// Handles a successful conversion reported by the driver.
    pub fn complete(&mut self, samples: &[Sample]) -> Wake {
        match self.converter {
            ConverterState::Idle => Wake::default(),
            ConverterState::HighSpeed => self.complete_high_speed(samples),
            ConverterState::LowSpeed(idx) => {
                let slot = &mut self.slots[idx];
                let n = samples.len().min(slot.buffer.len());
                slot.buffer[..n].copy_from_slice(&samples[..n]);
                slot.done = true;
                self.schedule_next();
                Wake { low_speed: true, high_speed: false }
            }
        }
    }

    fn complete_high_speed(&mut self, samples: &[Sample]) -> Wake {
        let hs = &mut self.hs;
        let n = samples.len().min(hs.chunk_left);
        if n == 0 {
            return Wake::default();
        }

        let offset = hs.write_pos;
        hs.buffer[offset..offset + n].copy_from_slice(&samples[..n]);

        let result = HighSpeedResult {
            count: n,
            offset,
            flags: ResultFlags {
                lost_event: mem::take(&mut hs.lost),
                error: mem::take(&mut hs.error),
            },
            sequence: hs.last.sequence + 1,
        };
        hs.last = result;

        if let Some(isr_fn) = hs.isr_fn {
            isr_fn(&hs.buffer[offset..offset + n]);
        }
        if let Some(record) = &hs.record {
            record.store(result);
        }
        if let Some(semaphore) = &hs.semaphore {
            semaphore.signal();
        }

        hs.write_pos += n;
        hs.remaining -= n;
        hs.chunk_left -= n;
        if hs.remaining == 0 {
            hs.write_pos = 0;
            hs.remaining = hs.buffer.len();
        }
        let wake = Wake { low_speed: false, high_speed: hs.uses_timer };

        if hs.chunk_left == 0 {
            hs.chunk_left = hs.remaining.min(hs.samples_per_event);
            self.schedule_next();
        }
        wake
    }

    /// Handles a failed conversion: flag it and move on. The failed work stays
    /// pending and is retried when its turn comes round again.
    pub fn fail(&mut self) {
        match self.converter {
            ConverterState::Idle => return,
            ConverterState::HighSpeed => self.hs.error = true,
            ConverterState::LowSpeed(idx) => self.slots[idx].errored = true,
        }
        self.schedule_next();
    }

    /// Records a trigger tick that arrived while the converter was busy.
    pub fn timer_missed(&mut self) {
        if self.hs.active {
            self.timer_missed = true;
            self.hs.lost = true;
        }
    }

    pub fn start_high_speed_stream(&mut self) {
        if self.hs.active {
            return;
        }
        self.hs.active = true;
        self.driver
            .start_timer_conversion(self.hs.channels, self.hs.frequency);
        self.kick();
    }

    /// Disarms the stream. A pending high-speed conversion is dropped by the
    /// driver, so a fresh decision is taken unless a low-speed conversion is
    /// still in flight.
    pub fn stop_high_speed_stream(&mut self) {
        if !self.hs.active {
            return;
        }
        self.hs.active = false;
        self.timer_missed = false;
        self.driver.stop_timer_conversion(self.hs.channels);
        if !matches!(self.converter, ConverterState::LowSpeed(_)) {
            self.schedule_next();
        }
    }

    /// Replaces the high-speed configuration, stopping the stream first and
    /// clearing every sink.
    pub fn reconfigure(
        &mut self,
        channels: ChannelSet,
        frequency: u32,
        buffer: Vec<Sample>,
        samples_per_event: usize,
    ) -> Displaced {
        self.stop_high_speed_stream();
        let len = buffer.len();
        let old = mem::replace(
            &mut self.hs,
            HighSpeedDevice {
                channels,
                frequency,
                buffer,
                samples_per_event,
                remaining: len,
                chunk_left: len.min(samples_per_event),
                ..HighSpeedDevice::unconfigured()
            },
        );
        Displaced {
            _buffer: old.buffer,
            _semaphore: old.semaphore,
            _record: old.record,
        }
    }

    /// Puts a request into the first free slot. Hands the request back if
    /// every slot is taken.
    pub fn claim(
        &mut self,
        channels: ChannelSet,
        buffer: Vec<Sample>,
        callback: LowSpeedCallback,
    ) -> Result<usize, (Vec<Sample>, LowSpeedCallback)> {
        let Some(idx) = self.slots.iter().position(|s| !s.active) else {
            return Err((buffer, callback));
        };
        self.slots[idx] = LowSpeedSlot {
            channels,
            buffer,
            callback: Some(callback),
            active: true,
            done: false,
            errored: false,
        };
        Ok(idx)
    }

    /// Frees slot `idx` if its conversion is done, returning its callback and result.
    pub fn take_finished(&mut self, idx: usize) -> Option<(LowSpeedCallback, LowSpeedResult)> {
        let slot = self.slots.get_mut(idx)?;
        if !(slot.active && slot.done) {
            return None;
        }
        let slot = mem::take(slot);
        let callback = slot.callback?;
        Some((
            callback,
            LowSpeedResult {
                channels: slot.channels,
                samples: slot.buffer,
                errored: slot.errored,
            },
        ))
    }

    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }
}
