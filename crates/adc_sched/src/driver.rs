use adc_types::ChannelSet;

/// Low-level converter access used by the scheduler.
///
/// Every method is called with the scheduler's critical section held, possibly
/// from inside an interrupt handler. Implementations must not block and must
/// never report a completion synchronously from within one of these calls;
/// results arrive later through the scheduler's interrupt entry points.
pub trait AdcDriver: Send + 'static {
    /// Arms the free-running hardware trigger for `channels` at `frequency` Hz.
    fn start_timer_conversion(&mut self, channels: ChannelSet, frequency: u32);

    /// Disarms the trigger and drops any pending timer-triggered conversion.
    /// No completion is reported for a dropped conversion.
    fn stop_timer_conversion(&mut self, channels: ChannelSet);

    /// Converts `count` samples of `channels` on subsequent trigger ticks.
    /// With `fire_now` the first conversion starts immediately because a tick
    /// was missed while the converter was busy.
    fn start_timer_triggered_conversion(&mut self, channels: ChannelSet, count: usize, fire_now: bool);

    /// Converts `count` samples of `channels` right away.
    fn start_immediate_conversion(&mut self, channels: ChannelSet, count: usize);
}
