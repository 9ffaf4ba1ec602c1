use serde::{Deserialize, Serialize};

use crate::data::ChannelSet;

/// Sizing of the scheduler itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of low-speed requests that may be outstanding at once.
    #[serde(default = "default_max_low_speed")]
    pub max_low_speed: usize,
    /// Depth of each high-speed listener queue. Events are dropped for a listener
    /// whose queue is full.
    #[serde(default = "default_listener_queue")]
    pub listener_queue: usize,
}

fn default_max_low_speed() -> usize { 4 }
fn default_listener_queue() -> usize { 16 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_low_speed: default_max_low_speed(),
            listener_queue: default_listener_queue(),
        }
    }
}

/// Parameters of the continuous high-speed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighSpeedConfig {
    /// Channels converted on every timer tick
    pub channels: ChannelSet,
    /// Timer frequency in Hz
    pub frequency: u32,
    /// Length of the circular sample buffer, in samples
    #[serde(default = "default_buffer_len")]
    pub buffer_len: usize,
    /// Samples per completion event
    #[serde(default = "default_samples_per_event")]
    pub samples_per_event: usize,
}

fn default_buffer_len() -> usize { 1024 }
fn default_samples_per_event() -> usize { 128 }

impl Default for HighSpeedConfig {
    fn default() -> Self {
        Self {
            channels: ChannelSet::from_channels(&[0, 1]),
            frequency: 1000,
            buffer_len: default_buffer_len(),
            samples_per_event: default_samples_per_event(),
        }
    }
}
