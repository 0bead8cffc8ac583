use crate::error::{Error, HwError, Result};
use crate::hw::{Direction, MmapGrant, PcmDevice, SampleFormat};
use nix::errno::Errno;
use tracing::warn;

/// First sample of one channel at the current ring offset, and the byte
/// distance between consecutive frames.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelPtr {
    base: *mut u8,
    step: usize,
}

// Only the worker holding the stream mutably dereferences these.
unsafe impl Send for ChannelPtr {}

impl ChannelPtr {
    pub(crate) fn new(base: *mut u8, step: usize) -> Self {
        Self { base, step }
    }
}

/// A mapped slice of one stream's ring, valid until committed.
///
/// Only one region per stream can exist at a time since it borrows the
/// stream mutably. Dropping a region without committing releases it with
/// a zero-length commit so the hardware and software pointers stay in step.
pub struct PeriodRegion<'a> {
    pcm: &'a mut dyn PcmDevice,
    direction: Direction,
    format: SampleFormat,
    grant: MmapGrant,
    channels: &'a [ChannelPtr],
    committed: bool,
}

impl<'a> PeriodRegion<'a> {
    pub(crate) fn new(
        pcm: &'a mut dyn PcmDevice,
        direction: Direction,
        format: SampleFormat,
        grant: MmapGrant,
        channels: &'a [ChannelPtr],
    ) -> Self {
        Self {
            pcm,
            direction,
            format,
            grant,
            channels,
            committed: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Frames granted, possibly fewer than requested.
    pub fn frames(&self) -> usize {
        self.grant.frames
    }

    /// Frame offset into the ring.
    pub fn offset(&self) -> usize {
        self.grant.offset
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    fn sample_ptr(&self, channel: usize, frame: usize) -> Option<*mut u8> {
        if frame >= self.grant.frames {
            return None;
        }
        let ch = self.channels.get(channel)?;
        Some(unsafe { ch.base.add(frame * ch.step) })
    }

    pub fn sample(&self, channel: usize, frame: usize) -> Option<f32> {
        let ptr = self.sample_ptr(channel, frame)?;
        let bytes = unsafe { std::slice::from_raw_parts(ptr, self.format.bytes()) };
        Some(self.format.decode(bytes))
    }

    /// Returns false when `channel` or `frame` is outside the region.
    pub fn set_sample(&mut self, channel: usize, frame: usize, value: f32) -> bool {
        let Some(ptr) = self.sample_ptr(channel, frame) else {
            return false;
        };
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, self.format.bytes()) };
        self.format.encode(value, bytes);
        true
    }

    pub fn silence_channel(&mut self, channel: usize) {
        let Some(ch) = self.channels.get(channel).copied() else {
            return;
        };
        let width = self.format.bytes();
        let mut dst = ch.base;
        for _ in 0..self.grant.frames {
            unsafe {
                std::ptr::write_bytes(dst, 0, width);
                dst = dst.add(ch.step);
            }
        }
    }

    pub fn silence(&mut self) {
        for channel in 0..self.channels.len() {
            self.silence_channel(channel);
        }
    }

    /// Hands the whole grant back to the hardware.
    pub fn commit(self) -> Result<usize> {
        let frames = self.grant.frames;
        self.commit_frames(frames)
    }

    /// Hands `frames` (no more than granted) back to the hardware.
    pub fn commit_frames(mut self, frames: usize) -> Result<usize> {
        if frames > self.grant.frames {
            return Err(Error::hw(
                self.direction,
                "mmap_commit",
                HwError::from_errno(Errno::EINVAL),
            ));
        }
        self.committed = true;
        self.pcm
            .mmap_commit(self.grant.offset, frames)
            .map_err(|e| Error::hw(self.direction, "mmap_commit", e))
    }
}

impl Drop for PeriodRegion<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        warn!(
            "{} region at {} released without commit",
            self.direction, self.grant.offset
        );
        let _ = self.pcm.mmap_commit(self.grant.offset, 0);
    }
}

/// What the worker does with each period's samples.
pub trait Payload {
    fn capture(&mut self, region: &PeriodRegion<'_>) {
        let _ = region;
    }

    /// Everything not written here must end up zero.
    fn playback(&mut self, region: &mut PeriodRegion<'_>) {
        region.silence();
    }
}

/// No analysis, silent output.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silence;

impl Payload for Silence {}
