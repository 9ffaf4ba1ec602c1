use serde::{Deserialize, Serialize};

/// Settings for the dispatcher thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// Dispatcher stack size in bytes
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
    /// Run the dispatcher at the highest thread priority the OS allows
    #[serde(default)]
    pub high_priority: bool,
}

fn default_thread_name() -> String { "timer-dispatch".to_string() }
fn default_stack_size() -> usize { 64 * 1024 }

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
            stack_size: default_stack_size(),
            high_priority: false,
        }
    }
}
