use super::{AccessMode, Direction, SampleFormat};
use crate::error::HwError;
use nix::libc::pollfd;
use std::time::Duration;

pub type HwResult<T> = Result<T, HwError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    Open,
    Setup,
    Prepared,
    Running,
    XRun,
    Draining,
    Paused,
    Suspended,
    Disconnected,
}

/// Wall clock timestamp with a microsecond field, as carried in PCM status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmStatus {
    pub state: PcmState,
    /// When the last state change (start, stop, xrun) happened.
    pub trigger: Timestamp,
    /// When the status was taken.
    pub updated: Timestamp,
}

/// One channel's location in the mapped ring, in the driver's own terms.
#[derive(Debug, Clone, Copy)]
pub struct RawArea {
    addr: *mut u8,
    first_bits: u32,
    step_bits: u32,
}

// Areas point into memory owned by the PCM that produced them and are only
// dereferenced by the context holding that PCM mutably.
unsafe impl Send for RawArea {}

impl RawArea {
    /// # Safety
    ///
    /// `addr` must stay valid for reads and writes of the whole ring
    /// described by `first_bits` and `step_bits` until the next
    /// `mmap_commit` on the PCM that produced it.
    pub unsafe fn new(addr: *mut u8, first_bits: u32, step_bits: u32) -> Self {
        Self {
            addr,
            first_bits,
            step_bits,
        }
    }

    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub fn first_bits(&self) -> u32 {
        self.first_bits
    }

    pub fn step_bits(&self) -> u32 {
        self.step_bits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapGrant {
    pub offset: usize,
    pub frames: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollEvents {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl PollEvents {
    pub fn from_revents(revents: i16) -> Self {
        use nix::libc::{POLLERR, POLLIN, POLLOUT};
        Self {
            readable: revents & POLLIN != 0,
            writable: revents & POLLOUT != 0,
            error: revents & POLLERR != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready(usize),
    TimedOut,
    Interrupted,
}

/// The hardware capability space of one stream while it is being narrowed.
pub trait HwParamSpace {
    fn set_periods_integer(&mut self) -> HwResult<()>;
    fn set_access(&mut self, access: AccessMode) -> HwResult<()>;
    fn set_format(&mut self, format: SampleFormat) -> HwResult<()>;
    fn set_rate(&mut self, rate: u32) -> HwResult<()>;
    fn channels_max(&self) -> HwResult<u32>;
    fn set_channels(&mut self, channels: u32) -> HwResult<()>;
    fn set_period_size(&mut self, frames: usize) -> HwResult<()>;
    fn set_periods(&mut self, periods: u32) -> HwResult<()>;
    fn set_buffer_size(&mut self, frames: usize) -> HwResult<()>;
    /// Applies the space to the device, all or nothing.
    fn install(&mut self) -> HwResult<()>;

    /// Value and rounding direction; a non-zero direction is inexact.
    fn rate(&self) -> HwResult<(u32, i32)>;
    fn period_size(&self) -> HwResult<(usize, i32)>;
    fn periods(&self) -> HwResult<(u32, i32)>;
    fn format(&self) -> HwResult<SampleFormat>;
    fn access(&self) -> HwResult<AccessMode>;
}

pub trait SwParamSpace {
    /// Timestamps are taken when the wakeup condition becomes true.
    fn set_tstamp_on_wakeup(&mut self) -> HwResult<()>;
    fn set_avail_min(&mut self, frames: usize) -> HwResult<()>;
    fn install(&mut self) -> HwResult<()>;
}

/// One opened direction of a sound card. Dropping it closes the handle.
pub trait PcmDevice {
    fn direction(&self) -> Direction;
    fn hw_params(&self) -> HwResult<Box<dyn HwParamSpace + '_>>;
    fn sw_params(&self) -> HwResult<Box<dyn SwParamSpace + '_>>;
    fn start(&self) -> HwResult<()>;
    /// Stops immediately, discarding pending frames.
    fn drop_frames(&self) -> HwResult<()>;
    fn prepare(&self) -> HwResult<()>;
    fn avail_update(&self) -> HwResult<usize>;
    fn status(&self) -> HwResult<PcmStatus>;
    /// Fills `areas` with one entry per channel.
    fn mmap_begin(&mut self, frames: usize, areas: &mut Vec<RawArea>) -> HwResult<MmapGrant>;
    fn mmap_commit(&mut self, offset: usize, frames: usize) -> HwResult<usize>;
    fn poll_descriptors(&self, fds: &mut Vec<pollfd>) -> HwResult<usize>;
    fn poll_revents(&self, fds: &mut [pollfd]) -> HwResult<PollEvents>;
}

/// The audio subsystem: how streams are opened, linked and waited on.
pub trait Backend: Send {
    type Pcm: PcmDevice + Send;

    const LABEL: &'static str;
    const WORKER_THREAD_NAME: &'static str;

    fn open(&self, direction: Direction, device: &str) -> HwResult<Self::Pcm>;
    /// Links the sample clocks of both streams. Returns whether it took.
    fn link(&self, a: &Self::Pcm, b: &Self::Pcm) -> bool;
    fn wait(&self, fds: &mut [pollfd], timeout: Duration) -> HwResult<WaitStatus>;
}
