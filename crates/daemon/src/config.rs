use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use adc_types::{ChannelSet, HighSpeedConfig, SchedulerConfig};
use anyhow::Context;
use boards::SimConfig;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use timer_service::TimerConfig;

/// Configuration for the daemon
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub high_speed: HighSpeedConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub sim: SimConfig,
    #[serde(flatten)]
    pub polling: PollConfig,
}

/// Periodic low-speed readings taken alongside the stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Channels converted on every poll
    #[serde(default = "default_low_speed_channels")]
    pub low_speed_channels: ChannelSet,
    /// Poll period in milliseconds, 0 disables polling
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long to run before exiting, 0 runs until killed
    #[serde(default)]
    pub run_seconds: u64,
}

fn default_low_speed_channels() -> ChannelSet { ChannelSet::from_channels(&[4, 5]) }
fn default_poll_interval_ms() -> u64 { 500 }

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            low_speed_channels: default_low_speed_channels(),
            poll_interval_ms: default_poll_interval_ms(),
            run_seconds: 0,
        }
    }
}

/// Loads the daemon configuration from `path`.
///
/// A missing file falls back to the defaults. A file that exists but cannot be
/// read or parsed is an error.
pub fn load_config(path: &Path) -> anyhow::Result<DaemonConfig> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("No configuration file at '{}', using defaults", path.display());
            return Ok(DaemonConfig::default());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Could not read configuration file at '{}'", path.display()))
        }
    };

    let config: DaemonConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Could not parse configuration file at '{}'", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
