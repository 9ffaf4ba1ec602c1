//! Multiplexes one analog-to-digital converter between a continuous,
//! hardware-timer-triggered high-speed stream and a bounded pool of on-demand
//! low-speed conversions.
//!
//! The hardware is reached through the [`AdcDriver`] trait. The driver reports
//! back through [`AdcScheduler::on_conversion_complete`],
//! [`AdcScheduler::on_conversion_error`] and [`AdcScheduler::on_timer_missed`],
//! which are safe to call from interrupt context: they never block, allocate
//! or log. Every completion picks the next conversion (round-robin among
//! pending low-speed requests, then the high-speed stream) and starts it before
//! returning. Low-speed callbacks are run later on a
//! [`timer_service::TimerService`] thread.

pub mod driver;
pub mod mock;
pub mod scheduler;
pub mod sinks;

pub use driver::AdcDriver;
pub use scheduler::{AdcScheduler, ConverterState, RequestError, SchedulerStatus};
pub use sinks::{EventRecord, Semaphore};
