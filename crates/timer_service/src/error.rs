use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimerError {
    /// The dispatcher thread could not be created
    #[error("Failed to spawn timer dispatcher: {0}")]
    Spawn(#[from] std::io::Error),
}
