#[cfg(target_os = "linux")]
pub mod alsa;
pub mod config;
pub mod format;
pub mod latency;
pub mod options;
pub mod sim;
pub mod traits;

pub use format::{AccessMode, SampleFormat};
pub use options::{RunConfig, StreamRequest};
pub use traits::{
    Backend, HwParamSpace, HwResult, MmapGrant, PcmDevice, PcmState, PcmStatus, PollEvents,
    RawArea, SwParamSpace, Timestamp, WaitStatus,
};

use std::fmt;

/// Hard cap on channels per stream.
pub const MAX_CHANNELS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Playback,
    Capture,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Self::Playback => "playback",
            Self::Capture => "capture",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
