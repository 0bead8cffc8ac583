//! A simulated duplex sound card.
//!
//! The card keeps a virtual sample clock that advances one period per
//! wait, holds its rings in ordinary memory and follows the same state
//! machine a real PCM does (prepared, running, xrun, setup). Faults can be
//! scheduled for a given wait to exercise recovery without hardware.

use super::traits::{
    Backend, HwParamSpace, HwResult, MmapGrant, PcmDevice, PcmState, PcmStatus, PollEvents,
    RawArea, SwParamSpace, Timestamp, WaitStatus,
};
use super::{AccessMode, Direction, SampleFormat};
use crate::error::HwError;
use nix::errno::Errno;
use nix::libc::{POLLIN, POLLOUT, pollfd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// What the simulated hardware is able to do.
#[derive(Debug, Clone)]
pub struct SimCaps {
    pub formats: Vec<SampleFormat>,
    pub access: Vec<AccessMode>,
    pub rates: Vec<u32>,
    pub max_channels: u32,
    pub min_period: usize,
    pub max_period: usize,
    pub max_periods: u32,
    pub link: bool,
    /// Byte the rings are filled with before anything is written.
    pub ring_fill: u8,
}

impl Default for SimCaps {
    fn default() -> Self {
        Self {
            formats: vec![SampleFormat::S32Le, SampleFormat::S16Le],
            access: vec![AccessMode::MmapInterleaved, AccessMode::MmapNonInterleaved],
            rates: vec![44_100, 48_000, 96_000],
            max_channels: 2,
            min_period: 8,
            max_period: 8192,
            max_periods: 32,
            link: true,
            ring_fill: 0x5a,
        }
    }
}

/// Faults keyed by the 1-based number of the wait they fire on.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// Directions that fail to open.
    pub missing: Vec<Direction>,
    /// The clock jumps past the whole ring, forcing an xrun.
    pub stall_at_wait: Option<u64>,
    /// That direction's descriptor reports an error without an xrun.
    pub poll_error_at_wait: Option<(Direction, u64)>,
    /// Enumerating that direction's descriptors fails once, just before
    /// the given wait.
    pub descriptors_fail_at_wait: Option<(Direction, u64)>,
    pub timeout_at_wait: Option<u64>,
    pub fail_prepare: bool,
    /// Hardware installs this period size whatever was asked for.
    pub period_quirk: Option<usize>,
    /// Capture runs this many frames ahead of playback.
    pub capture_skew: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Open(Direction),
    Start(Direction),
    Drop(Direction),
    Prepare(Direction),
    Close(Direction),
}

#[derive(Debug, Clone, Copy)]
struct Installed {
    access: AccessMode,
    format: SampleFormat,
    rate: u32,
    channels: u32,
    period: usize,
    periods: u32,
}

impl Installed {
    fn buffer(&self) -> u64 {
        (self.period * self.periods as usize) as u64
    }

    fn ring_bytes(&self) -> usize {
        self.buffer() as usize * self.channels as usize * self.format.bytes()
    }
}

#[derive(Debug, Clone, Copy)]
struct SimStream {
    state: PcmState,
    hw: Option<Installed>,
    avail_min: usize,
    tstamp_on_wakeup: bool,
    hw_ptr: u64,
    appl_ptr: u64,
    trigger: u64,
}

impl Default for SimStream {
    fn default() -> Self {
        Self {
            state: PcmState::Open,
            hw: None,
            avail_min: 1,
            tstamp_on_wakeup: false,
            hw_ptr: 0,
            appl_ptr: 0,
            trigger: 0,
        }
    }
}

impl SimStream {
    fn buffer(&self) -> u64 {
        self.hw.map(|hw| hw.buffer()).unwrap_or(0)
    }

    fn avail(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Playback => (self.buffer() + self.hw_ptr).saturating_sub(self.appl_ptr),
            Direction::Capture => self.hw_ptr.saturating_sub(self.appl_ptr),
        }
    }
}

#[derive(Debug)]
struct Card {
    caps: SimCaps,
    faults: SimFaults,
    streams: [SimStream; 2],
    linked: bool,
    clock: u64,
    waits: u64,
    forced_error: Option<Direction>,
    events: Vec<SimEvent>,
}

fn idx(direction: Direction) -> usize {
    match direction {
        Direction::Playback => 0,
        Direction::Capture => 1,
    }
}

fn other(direction: Direction) -> Direction {
    match direction {
        Direction::Playback => Direction::Capture,
        Direction::Capture => Direction::Playback,
    }
}

fn err(errno: Errno) -> HwError {
    HwError::from_errno(errno)
}

impl Card {
    fn stream(&mut self, direction: Direction) -> &mut SimStream {
        &mut self.streams[idx(direction)]
    }

    fn rate(&self) -> u32 {
        self.streams
            .iter()
            .find_map(|s| s.hw.map(|hw| hw.rate))
            .unwrap_or(48_000)
    }

    fn period(&self) -> u64 {
        self.streams
            .iter()
            .find_map(|s| s.hw.map(|hw| hw.period as u64))
            .unwrap_or(0)
    }

    fn timestamp(&self, frames: u64) -> Timestamp {
        let rate = self.rate() as u64;
        let usec = frames * 1_000_000 / rate;
        Timestamp {
            sec: (usec / 1_000_000) as i64,
            usec: (usec % 1_000_000) as i64,
        }
    }

    /// Directions a lifecycle command on `direction` reaches.
    fn group(&self, direction: Direction) -> Vec<Direction> {
        let peer = other(direction);
        if self.linked && self.streams[idx(peer)].hw.is_some() {
            vec![direction, peer]
        } else {
            vec![direction]
        }
    }

    fn start(&mut self, direction: Direction) -> HwResult<()> {
        if self.stream(direction).state != PcmState::Prepared {
            return Err(err(Errno::EBADFD));
        }
        let clock = self.clock;
        let skew = self.faults.capture_skew as u64;
        for dir in self.group(direction) {
            let s = self.stream(dir);
            if s.state != PcmState::Prepared {
                continue;
            }
            s.state = PcmState::Running;
            s.trigger = clock;
            if dir == Direction::Capture {
                s.hw_ptr += skew;
            }
            self.events.push(SimEvent::Start(dir));
        }
        Ok(())
    }

    fn drop_frames(&mut self, direction: Direction) -> HwResult<()> {
        if self.stream(direction).hw.is_none() {
            return Err(err(Errno::EBADFD));
        }
        let clock = self.clock;
        for dir in self.group(direction) {
            let s = self.stream(dir);
            if s.state == PcmState::Setup {
                continue;
            }
            s.state = PcmState::Setup;
            s.trigger = clock;
            self.events.push(SimEvent::Drop(dir));
        }
        Ok(())
    }

    fn prepare(&mut self, direction: Direction) -> HwResult<()> {
        if self.stream(direction).hw.is_none() {
            return Err(err(Errno::EBADFD));
        }
        if self.faults.fail_prepare {
            return Err(err(Errno::EIO));
        }
        for dir in self.group(direction) {
            let s = self.stream(dir);
            s.state = PcmState::Prepared;
            s.hw_ptr = 0;
            s.appl_ptr = 0;
            self.events.push(SimEvent::Prepare(dir));
        }
        Ok(())
    }

    fn advance(&mut self, step: u64) {
        let start = self.clock;
        for (i, s) in self.streams.iter_mut().enumerate() {
            if s.state != PcmState::Running {
                continue;
            }
            let buffer = s.buffer();
            let headroom = if i == idx(Direction::Playback) {
                s.appl_ptr.saturating_sub(s.hw_ptr)
            } else {
                buffer.saturating_sub(s.hw_ptr.saturating_sub(s.appl_ptr))
            };
            if step > headroom {
                s.hw_ptr += headroom;
                s.state = PcmState::XRun;
                s.trigger = start + headroom;
            } else {
                s.hw_ptr += step;
            }
        }
        self.clock += step;
    }
}

/// The simulated card. Clones share the same card.
#[derive(Debug, Clone)]
pub struct SimBackend {
    card: Arc<Mutex<Card>>,
    realtime: bool,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new(SimCaps::default(), SimFaults::default())
    }
}

impl SimBackend {
    pub fn new(caps: SimCaps, faults: SimFaults) -> Self {
        Self {
            card: Arc::new(Mutex::new(Card {
                caps,
                faults,
                streams: [SimStream::default(); 2],
                linked: false,
                clock: 0,
                waits: 0,
                forced_error: None,
                events: Vec::new(),
            })),
            realtime: false,
        }
    }

    /// Sleep one period of wall time per wait.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    fn card(&self) -> MutexGuard<'_, Card> {
        self.card.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.card().events.clone()
    }

    pub fn waits(&self) -> u64 {
        self.card().waits
    }

    /// Virtual time in frames since the card was created.
    pub fn clock(&self) -> u64 {
        self.card().clock
    }

    pub fn state(&self, direction: Direction) -> PcmState {
        self.card().streams[idx(direction)].state
    }
}

impl Backend for SimBackend {
    type Pcm = SimPcm;

    const LABEL: &'static str = "SIM";
    const WORKER_THREAD_NAME: &'static str = "sim-worker";

    fn open(&self, direction: Direction, _device: &str) -> HwResult<SimPcm> {
        let mut card = self.card();
        if card.faults.missing.contains(&direction) {
            return Err(err(Errno::ENOENT));
        }
        *card.stream(direction) = SimStream::default();
        card.events.push(SimEvent::Open(direction));
        Ok(SimPcm {
            card: self.card.clone(),
            direction,
            ring: Vec::new(),
        })
    }

    fn link(&self, a: &SimPcm, b: &SimPcm) -> bool {
        let mut card = self.card();
        if !card.caps.link || a.direction == b.direction {
            return false;
        }
        card.linked = true;
        true
    }

    fn wait(&self, _fds: &mut [pollfd], timeout: Duration) -> HwResult<WaitStatus> {
        let (step, rate) = {
            let mut card = self.card();
            card.waits += 1;
            let n = card.waits;
            if card.faults.timeout_at_wait == Some(n) {
                return Ok(WaitStatus::TimedOut);
            }
            if !card.streams.iter().any(|s| s.state == PcmState::Running) {
                return Ok(WaitStatus::TimedOut);
            }
            let period = card.period();
            let step = if card.faults.stall_at_wait == Some(n) {
                let deepest = card.streams.iter().map(|s| s.buffer()).max().unwrap_or(0);
                deepest + period
            } else {
                period
            };
            card.advance(step);
            if let Some((direction, at)) = card.faults.poll_error_at_wait
                && at == n
            {
                card.forced_error = Some(direction);
            }
            (step, card.rate())
        };
        if self.realtime {
            let wall = Duration::from_secs_f64(step as f64 / rate as f64);
            std::thread::sleep(wall.min(timeout));
        }
        Ok(WaitStatus::Ready(1))
    }
}

/// One opened direction of the simulated card.
#[derive(Debug)]
pub struct SimPcm {
    card: Arc<Mutex<Card>>,
    direction: Direction,
    ring: Vec<u8>,
}

impl SimPcm {
    fn card(&self) -> MutexGuard<'_, Card> {
        self.card.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The mapped ring as last written.
    pub fn ring(&self) -> &[u8] {
        &self.ring
    }

    /// Frames handed over by the application since the last prepare.
    pub fn appl_ptr(&self) -> u64 {
        self.card().streams[idx(self.direction)].appl_ptr
    }

    pub fn hw_ptr(&self) -> u64 {
        self.card().streams[idx(self.direction)].hw_ptr
    }

    pub fn avail_min(&self) -> usize {
        self.card().streams[idx(self.direction)].avail_min
    }

    pub fn tstamp_on_wakeup(&self) -> bool {
        self.card().streams[idx(self.direction)].tstamp_on_wakeup
    }
}

impl Drop for SimPcm {
    fn drop(&mut self) {
        let direction = self.direction;
        let mut card = self.card();
        *card.stream(direction) = SimStream::default();
        card.events.push(SimEvent::Close(direction));
    }
}

impl PcmDevice for SimPcm {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn hw_params(&self) -> HwResult<Box<dyn HwParamSpace + '_>> {
        Ok(Box::new(SimHwParams {
            pcm: self,
            pending: Pending::default(),
            installed: None,
        }))
    }

    fn sw_params(&self) -> HwResult<Box<dyn SwParamSpace + '_>> {
        let s = self.card().streams[idx(self.direction)];
        if s.hw.is_none() {
            return Err(err(Errno::EBADFD));
        }
        Ok(Box::new(SimSwParams {
            pcm: self,
            avail_min: s.avail_min,
            tstamp_on_wakeup: s.tstamp_on_wakeup,
        }))
    }

    fn start(&self) -> HwResult<()> {
        self.card().start(self.direction)
    }

    fn drop_frames(&self) -> HwResult<()> {
        self.card().drop_frames(self.direction)
    }

    fn prepare(&self) -> HwResult<()> {
        self.card().prepare(self.direction)
    }

    fn avail_update(&self) -> HwResult<usize> {
        let card = self.card();
        let s = card.streams[idx(self.direction)];
        match s.state {
            PcmState::XRun => Err(err(Errno::EPIPE)),
            PcmState::Prepared | PcmState::Running => Ok(s.avail(self.direction) as usize),
            _ => Err(err(Errno::EBADFD)),
        }
    }

    fn status(&self) -> HwResult<PcmStatus> {
        let card = self.card();
        let s = card.streams[idx(self.direction)];
        Ok(PcmStatus {
            state: s.state,
            trigger: card.timestamp(s.trigger),
            updated: card.timestamp(card.clock),
        })
    }

    fn mmap_begin(&mut self, frames: usize, areas: &mut Vec<RawArea>) -> HwResult<MmapGrant> {
        let (hw, grant) = {
            let card = self.card();
            let s = card.streams[idx(self.direction)];
            let hw = s.hw.ok_or(err(Errno::EBADFD))?;
            match s.state {
                PcmState::Prepared | PcmState::Running => {}
                PcmState::XRun => return Err(err(Errno::EPIPE)),
                _ => return Err(err(Errno::EBADFD)),
            }
            let buffer = hw.buffer();
            let offset = s.appl_ptr % buffer;
            let granted = (frames as u64)
                .min(s.avail(self.direction))
                .min(buffer - offset);
            let grant = MmapGrant {
                offset: offset as usize,
                frames: granted as usize,
            };
            (hw, grant)
        };

        if self.ring.len() != hw.ring_bytes() {
            let fill = self.card().caps.ring_fill;
            self.ring = vec![fill; hw.ring_bytes()];
        }

        let width = hw.format.bytes();
        let bits = (width * 8) as u32;
        let base = self.ring.as_mut_ptr();
        areas.clear();
        for ch in 0..hw.channels as usize {
            // The ring outlives the grant; it is only reallocated above.
            let area = unsafe {
                match hw.access {
                    AccessMode::MmapNonInterleaved => {
                        RawArea::new(base.add(ch * hw.buffer() as usize * width), 0, bits)
                    }
                    AccessMode::MmapInterleaved | AccessMode::MmapComplex => {
                        RawArea::new(base, ch as u32 * bits, hw.channels * bits)
                    }
                }
            };
            areas.push(area);
        }
        Ok(grant)
    }

    fn mmap_commit(&mut self, offset: usize, frames: usize) -> HwResult<usize> {
        let direction = self.direction;
        let mut card = self.card();
        let s = card.stream(direction);
        match s.state {
            PcmState::Prepared | PcmState::Running => {}
            PcmState::XRun => return Err(err(Errno::EPIPE)),
            _ => return Err(err(Errno::EBADFD)),
        }
        let buffer = s.buffer();
        if buffer == 0 || (s.appl_ptr % buffer) as usize != offset {
            return Err(err(Errno::EINVAL));
        }
        if frames as u64 > s.avail(direction) {
            return Err(err(Errno::EINVAL));
        }
        s.appl_ptr += frames as u64;
        Ok(frames)
    }

    fn poll_descriptors(&self, fds: &mut Vec<pollfd>) -> HwResult<usize> {
        {
            let mut card = self.card();
            if let Some((direction, at)) = card.faults.descriptors_fail_at_wait
                && direction == self.direction
                && at == card.waits + 1
            {
                card.faults.descriptors_fail_at_wait = None;
                return Err(err(Errno::EBADFD));
            }
        }
        let events = match self.direction {
            Direction::Playback => POLLOUT,
            Direction::Capture => POLLIN,
        };
        fds.push(pollfd {
            fd: -1,
            events,
            revents: 0,
        });
        Ok(1)
    }

    fn poll_revents(&self, _fds: &mut [pollfd]) -> HwResult<PollEvents> {
        let mut card = self.card();
        if card.forced_error == Some(self.direction) {
            card.forced_error = None;
            return Ok(PollEvents {
                error: true,
                ..PollEvents::default()
            });
        }
        let s = card.streams[idx(self.direction)];
        if s.state == PcmState::XRun {
            return Ok(PollEvents {
                error: true,
                ..PollEvents::default()
            });
        }
        let ready = s.state == PcmState::Running && s.avail(self.direction) >= s.avail_min as u64;
        Ok(PollEvents {
            readable: ready && self.direction == Direction::Capture,
            writable: ready && self.direction == Direction::Playback,
            error: false,
        })
    }
}

#[derive(Debug, Default)]
struct Pending {
    integer: bool,
    access: Option<AccessMode>,
    format: Option<SampleFormat>,
    rate: Option<u32>,
    channels: Option<u32>,
    period: Option<usize>,
    periods: Option<u32>,
    buffer: Option<usize>,
}

struct SimHwParams<'a> {
    pcm: &'a SimPcm,
    pending: Pending,
    installed: Option<Installed>,
}

impl SimHwParams<'_> {
    fn caps(&self) -> SimCaps {
        self.pcm.card().caps.clone()
    }
}

fn check(ok: bool) -> HwResult<()> {
    if ok { Ok(()) } else { Err(err(Errno::EINVAL)) }
}

impl HwParamSpace for SimHwParams<'_> {
    fn set_periods_integer(&mut self) -> HwResult<()> {
        self.pending.integer = true;
        Ok(())
    }

    fn set_access(&mut self, access: AccessMode) -> HwResult<()> {
        check(self.caps().access.contains(&access))?;
        self.pending.access = Some(access);
        Ok(())
    }

    fn set_format(&mut self, format: SampleFormat) -> HwResult<()> {
        check(self.caps().formats.contains(&format))?;
        self.pending.format = Some(format);
        Ok(())
    }

    fn set_rate(&mut self, rate: u32) -> HwResult<()> {
        check(self.caps().rates.contains(&rate))?;
        self.pending.rate = Some(rate);
        Ok(())
    }

    fn channels_max(&self) -> HwResult<u32> {
        Ok(self.caps().max_channels)
    }

    fn set_channels(&mut self, channels: u32) -> HwResult<()> {
        check(channels >= 1 && channels <= self.caps().max_channels)?;
        self.pending.channels = Some(channels);
        Ok(())
    }

    fn set_period_size(&mut self, frames: usize) -> HwResult<()> {
        let caps = self.caps();
        check(frames >= caps.min_period && frames <= caps.max_period)?;
        self.pending.period = Some(frames);
        Ok(())
    }

    fn set_periods(&mut self, periods: u32) -> HwResult<()> {
        check(periods >= 1 && periods <= self.caps().max_periods)?;
        self.pending.periods = Some(periods);
        Ok(())
    }

    fn set_buffer_size(&mut self, frames: usize) -> HwResult<()> {
        if let (Some(period), Some(periods)) = (self.pending.period, self.pending.periods) {
            check(frames == period * periods as usize)?;
        }
        self.pending.buffer = Some(frames);
        Ok(())
    }

    fn install(&mut self) -> HwResult<()> {
        let p = &self.pending;
        let (Some(access), Some(format), Some(rate), Some(channels), Some(period), Some(periods)) = (
            p.access, p.format, p.rate, p.channels, p.period, p.periods,
        ) else {
            return Err(err(Errno::EINVAL));
        };
        let quirk = self.pcm.card().faults.period_quirk;
        let installed = Installed {
            access,
            format,
            rate,
            channels,
            period: quirk.unwrap_or(period),
            periods,
        };
        let mut card = self.pcm.card();
        let s = card.stream(self.pcm.direction);
        s.hw = Some(installed);
        s.state = PcmState::Prepared;
        s.hw_ptr = 0;
        s.appl_ptr = 0;
        self.installed = Some(installed);
        Ok(())
    }

    fn rate(&self) -> HwResult<(u32, i32)> {
        self.installed.map(|hw| (hw.rate, 0)).ok_or(err(Errno::EINVAL))
    }

    fn period_size(&self) -> HwResult<(usize, i32)> {
        self.installed.map(|hw| (hw.period, 0)).ok_or(err(Errno::EINVAL))
    }

    fn periods(&self) -> HwResult<(u32, i32)> {
        self.installed.map(|hw| (hw.periods, 0)).ok_or(err(Errno::EINVAL))
    }

    fn format(&self) -> HwResult<SampleFormat> {
        self.installed.map(|hw| hw.format).ok_or(err(Errno::EINVAL))
    }

    fn access(&self) -> HwResult<AccessMode> {
        self.installed.map(|hw| hw.access).ok_or(err(Errno::EINVAL))
    }
}

struct SimSwParams<'a> {
    pcm: &'a SimPcm,
    avail_min: usize,
    tstamp_on_wakeup: bool,
}

impl SwParamSpace for SimSwParams<'_> {
    fn set_tstamp_on_wakeup(&mut self) -> HwResult<()> {
        self.tstamp_on_wakeup = true;
        Ok(())
    }

    fn set_avail_min(&mut self, frames: usize) -> HwResult<()> {
        check(frames >= 1)?;
        self.avail_min = frames;
        Ok(())
    }

    fn install(&mut self) -> HwResult<()> {
        let mut card = self.pcm.card();
        let s = card.stream(self.pcm.direction);
        s.avail_min = self.avail_min;
        s.tstamp_on_wakeup = self.tstamp_on_wakeup;
        Ok(())
    }
}
