use thiserror::Error;

/// Errors reported by the conversion scheduler and its hardware glue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdcError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    /// The high-speed stream was started before it was initialised
    #[error("High-speed stream not configured")]
    NotConfigured,
    /// The scheduler or the board went away while a caller was waiting on it
    #[error("Scheduler shut down")]
    ShutDown,
    /// The timer service could not be used
    #[error("Timer error: {0}")]
    TimerError(String),
    /// Hardware or board thread failure
    #[error("Hardware error: {0}")]
    HardwareError(String),
}
