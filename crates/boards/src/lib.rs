//! Board integrations: the glue between a converter and the scheduler's
//! interrupt entry points.

use adc_sched::{AdcDriver, AdcScheduler};
use adc_types::{ErrorCode, Sample};

#[cfg(feature = "sim_v1")]
pub mod sim_v1;
#[cfg(feature = "sim_v1")]
pub use sim_v1::{sim_board, SimBoard, SimConfig, SimDriver, SimHandle};

/// Where a board delivers its conversion interrupts.
///
/// All three methods are called from the board's interrupt context and must
/// not block.
pub trait InterruptSink: Send + Sync + 'static {
    fn conversion_complete(&self, samples: &[Sample]);
    fn conversion_error(&self, code: ErrorCode);
    fn timer_missed(&self);
}

impl<D: AdcDriver> InterruptSink for AdcScheduler<D> {
    fn conversion_complete(&self, samples: &[Sample]) {
        self.on_conversion_complete(samples);
    }

    fn conversion_error(&self, code: ErrorCode) {
        self.on_conversion_error(code);
    }

    fn timer_missed(&self) {
        self.on_timer_missed();
    }
}
