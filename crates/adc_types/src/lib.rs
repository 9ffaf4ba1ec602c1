//! Shared types for the ADC scheduler workspace
//!
//! This crate contains the value types passed between the converter driver, the
//! scheduler and its users: channel sets, high-speed and low-speed results, and
//! the serde configuration structs loaded by the daemon.

pub mod config;
pub mod data;
pub mod error;

// Re-export commonly used types
pub use config::*;
pub use data::*;
pub use error::*;
