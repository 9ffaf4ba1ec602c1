use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use adc_types::ChannelSet;

use crate::driver::AdcDriver;

/// One call the scheduler made on the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCommand {
    StartTimer { channels: ChannelSet, frequency: u32 },
    StopTimer { channels: ChannelSet },
    TimerTriggered { channels: ChannelSet, count: usize, fire_now: bool },
    Immediate { channels: ChannelSet, count: usize },
}

impl DriverCommand {
    /// True for commands that start a conversion.
    pub fn is_conversion(&self) -> bool {
        matches!(self, DriverCommand::TimerTriggered { .. } | DriverCommand::Immediate { .. })
    }
}

/// A stubbed-out driver that does not access any hardware.
#[derive(Debug, Default)]
pub struct MockDriver {
    log: MockLog,
}

impl MockDriver {
    /// Creates the driver and a handle for reading back what it was asked to do.
    pub fn new() -> (Self, MockLog) {
        let driver = Self::default();
        let log = driver.log.clone();
        (driver, log)
    }
}

impl AdcDriver for MockDriver {
    fn start_timer_conversion(&mut self, channels: ChannelSet, frequency: u32) {
        self.log.push(DriverCommand::StartTimer { channels, frequency });
    }

    fn stop_timer_conversion(&mut self, channels: ChannelSet) {
        self.log.push(DriverCommand::StopTimer { channels });
    }

    fn start_timer_triggered_conversion(&mut self, channels: ChannelSet, count: usize, fire_now: bool) {
        self.log.push(DriverCommand::TimerTriggered { channels, count, fire_now });
    }

    fn start_immediate_conversion(&mut self, channels: ChannelSet, count: usize) {
        self.log.push(DriverCommand::Immediate { channels, count });
    }
}

/// Shared view of the commands a [`MockDriver`] received.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    commands: Arc<Mutex<Vec<DriverCommand>>>,
}

impl MockLog {
    fn lock(&self) -> MutexGuard<'_, Vec<DriverCommand>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, command: DriverCommand) {
        self.lock().push(command);
    }

    /// Every command received so far.
    pub fn commands(&self) -> Vec<DriverCommand> {
        self.lock().clone()
    }

    pub fn last(&self) -> Option<DriverCommand> {
        self.lock().last().copied()
    }

    /// Drains the recorded commands.
    pub fn take(&self) -> Vec<DriverCommand> {
        std::mem::take(&mut *self.lock())
    }

    /// The most recent conversion the scheduler started.
    pub fn last_conversion(&self) -> Option<DriverCommand> {
        self.lock().iter().rev().find(|c| c.is_conversion()).copied()
    }
}
