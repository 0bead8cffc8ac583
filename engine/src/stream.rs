use crate::error::{Error, HwError, Result};
use crate::hw::{AccessMode, Direction, PcmDevice, RawArea, SampleFormat};
use crate::region::{ChannelPtr, PeriodRegion};
use nix::errno::Errno;

/// Parameters a stream ended up with after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub sample_rate: u32,
    pub period_frames: usize,
    pub periods: u32,
    pub channels: u32,
    pub format: SampleFormat,
    pub access: AccessMode,
}

/// One configured direction. Parameters never change after construction.
#[derive(Debug)]
pub struct Stream<P: PcmDevice> {
    pcm: P,
    direction: Direction,
    params: Negotiated,
    areas: Vec<RawArea>,
    ptrs: Vec<ChannelPtr>,
}

impl<P: PcmDevice> Stream<P> {
    pub(crate) fn new(pcm: P, params: Negotiated) -> Self {
        let channels = params.channels as usize;
        Self {
            direction: pcm.direction(),
            pcm,
            params,
            areas: Vec::with_capacity(channels),
            ptrs: Vec::with_capacity(channels),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn params(&self) -> &Negotiated {
        &self.params
    }

    pub fn channels(&self) -> u32 {
        self.params.channels
    }

    pub fn period_frames(&self) -> usize {
        self.params.period_frames
    }

    pub fn buffer_frames(&self) -> usize {
        self.params.period_frames * self.params.periods as usize
    }

    pub fn pcm(&self) -> &P {
        &self.pcm
    }

    /// Maps up to `frames` frames of the ring. The grant may be shorter
    /// near the wrap point.
    pub fn begin(&mut self, frames: usize) -> Result<PeriodRegion<'_>> {
        let direction = self.direction;
        let grant = self
            .pcm
            .mmap_begin(frames, &mut self.areas)
            .map_err(|e| Error::hw(direction, "mmap_begin", e))?;

        let channels = self.params.channels as usize;
        if self.areas.len() < channels {
            let _ = self.pcm.mmap_commit(grant.offset, 0);
            return Err(Error::hw(
                direction,
                "mmap_begin",
                HwError::from_errno(Errno::ENXIO),
            ));
        }

        self.ptrs.clear();
        for area in &self.areas[..channels] {
            let bits = area.first_bits() as usize + area.step_bits() as usize * grant.offset;
            // The driver guarantees the area covers the whole ring.
            let base = unsafe { area.addr().add(bits >> 3) };
            self.ptrs
                .push(ChannelPtr::new(base, (area.step_bits() >> 3) as usize));
        }

        Ok(PeriodRegion::new(
            &mut self.pcm,
            direction,
            self.params.format,
            grant,
            &self.ptrs,
        ))
    }

    pub fn start(&self) -> Result<()> {
        self.pcm
            .start()
            .map_err(|e| Error::hw(self.direction, "pcm_start", e))
    }

    pub fn stop(&self) -> Result<()> {
        self.pcm
            .drop_frames()
            .map_err(|e| Error::hw(self.direction, "pcm_drop", e))
    }

    pub fn prepare(&self) -> Result<()> {
        self.pcm
            .prepare()
            .map_err(|e| Error::hw(self.direction, "pcm_prepare", e))
    }

    pub fn avail(&self) -> std::result::Result<usize, HwError> {
        self.pcm.avail_update()
    }
}
