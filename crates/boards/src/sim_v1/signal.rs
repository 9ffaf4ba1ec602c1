use std::f64::consts::PI;
use std::time::Instant;

use adc_types::{ChannelSet, Sample};
use rand::Rng;

use super::SimConfig;

const FULL_SCALE: f64 = 4095.0;
const MID_SCALE: f64 = 2048.0;

/// Synthesises 12-bit codes: a sine per channel, phase-shifted by channel
/// index, plus uniform noise.
pub(crate) struct SignalGenerator {
    start: Instant,
    amplitude: f64,
    signal_hz: f64,
    noise: f64,
}

impl SignalGenerator {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            start: Instant::now(),
            amplitude: config.amplitude.clamp(0.0, 1.0),
            signal_hz: config.signal_hz,
            noise: config.noise.clamp(0.0, 1.0),
        }
    }

    /// Fills `out` with samples cycling through `channels`, starting at the
    /// channel for sample number `first`.
    pub fn fill<R: Rng>(&self, rng: &mut R, channels: ChannelSet, first: usize, out: &mut Vec<Sample>, n: usize) {
        out.clear();
        let per_conversion = channels.count().max(1);
        let t = self.start.elapsed().as_secs_f64();
        for i in first..first + n {
            let channel = channels.iter().nth(i % per_conversion).unwrap_or(0);
            let phase = f64::from(channel) * PI / 8.0;
            let wave = (2.0 * PI * self.signal_hz * t + phase).sin() * self.amplitude;
            let noise = if self.noise > 0.0 {
                rng.gen_range(-1.0..=1.0) * self.noise
            } else {
                0.0
            };
            let code = MID_SCALE + (wave + noise) * (MID_SCALE - 1.0);
            out.push(code.round().clamp(0.0, FULL_SCALE) as Sample);
        }
    }
}
