//! Software timers run from a single dispatcher thread.
//!
//! A [`TimerService`] owns one thread that sleeps until the earliest timer
//! deadline or until a timer is jabbed. [`Timer`] handles are created from the
//! service and can be started as one-shot, periodic or "infinite" timers. An
//! infinite periodic timer never expires on its own and fires once per jab,
//! which makes it the usual way to hand work from an interrupt handler over to
//! thread context: the handler calls [`Timer::jab_from_interrupt`], which never
//! blocks, and the callback runs on the dispatcher thread.
//!
//! Callbacks run outside the list lock, so they may start, stop or jab any
//! timer, including their own.

pub mod config;
pub mod error;
mod list;
mod service;
mod timer;

pub use config::TimerConfig;
pub use error::TimerError;
pub use service::TimerService;
pub use timer::{Delay, Timer};
