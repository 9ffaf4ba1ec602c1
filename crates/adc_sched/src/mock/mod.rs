//! A driver that records commands instead of touching hardware.
//!
//! Tests play the hardware by calling the scheduler's interrupt entry points
//! by hand after inspecting what the scheduler asked for.

mod driver;

pub use driver::{DriverCommand, MockDriver, MockLog};
