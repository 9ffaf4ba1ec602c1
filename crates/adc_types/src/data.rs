use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A raw converter code.
pub type Sample = u16;

/// Driver-specific code reported with a failed conversion.
pub type ErrorCode = u32;

/// Bitmask selecting which converter inputs a conversion targets.
///
/// The meaning of each bit is up to the hardware driver. A conversion over a
/// channel set produces one sample per selected channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSet(pub u32);

impl ChannelSet {
    /// No channels selected.
    pub const EMPTY: ChannelSet = ChannelSet(0);

    /// Highest channel index a set can hold.
    pub const MAX_CHANNEL: u8 = 31;

    /// A set holding a single channel. Indices above [`Self::MAX_CHANNEL`] select nothing.
    pub const fn single(channel: u8) -> Self {
        if channel > Self::MAX_CHANNEL {
            Self::EMPTY
        } else {
            ChannelSet(1 << channel)
        }
    }

    /// Builds a set from a list of channel indices.
    pub fn from_channels(channels: &[u8]) -> Self {
        channels
            .iter()
            .fold(Self::EMPTY, |set, &ch| set.with(ch))
    }

    /// Returns a copy of this set with `channel` added.
    pub const fn with(self, channel: u8) -> Self {
        ChannelSet(self.0 | Self::single(channel).0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Number of selected channels, which is also the number of samples per conversion.
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, channel: u8) -> bool {
        channel <= Self::MAX_CHANNEL && self.0 & (1 << channel) != 0
    }

    /// Iterates over the selected channel indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..=Self::MAX_CHANNEL).filter(move |&ch| self.contains(ch))
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, ch) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", ch)?;
        }
        write!(f, "}}")
    }
}

/// Flags attached to a high-speed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultFlags {
    /// The hardware trigger fired while the converter was busy, so at least one
    /// sample period was lost before this event.
    pub lost_event: bool,
    /// A conversion error on the high-speed stream was retried since the previous event.
    pub error: bool,
}

impl ResultFlags {
    pub const fn is_clean(self) -> bool {
        !self.lost_event && !self.error
    }
}

/// Snapshot of one high-speed completion.
///
/// `offset` and `count` locate the new samples inside the circular buffer the
/// stream was initialised with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HighSpeedResult {
    /// Number of new samples.
    pub count: usize,
    /// Position of the first new sample in the circular buffer.
    pub offset: usize,
    pub flags: ResultFlags,
    /// Monotonic event counter since the last init, starting at 1.
    pub sequence: u64,
}

/// A high-speed result delivered in thread context, with its samples copied out
/// of the circular buffer.
#[derive(Debug, Clone)]
pub struct HighSpeedEvent {
    pub result: HighSpeedResult,
    pub samples: Arc<[Sample]>,
}

/// Outcome of a low-speed conversion, handed to the request's callback.
///
/// `samples` is the buffer the caller supplied with the request, resized to one
/// sample per selected channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowSpeedResult {
    pub channels: ChannelSet,
    pub samples: Vec<Sample>,
    /// At least one attempt at this conversion failed before it succeeded.
    pub errored: bool,
}
