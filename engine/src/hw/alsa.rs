//! libasound PCM access through the raw `alsa-sys` bindings.
//!
//! The safe `alsa` wrapper does not expose `snd_pcm_mmap_begin` channel
//! areas, so every call here goes straight to the C library.

use super::traits::{
    Backend, HwParamSpace, HwResult, MmapGrant, PcmDevice, PcmState, PcmStatus, PollEvents,
    RawArea, SwParamSpace, Timestamp, WaitStatus,
};
use super::{AccessMode, Direction, SampleFormat};
use crate::error::HwError;
use alsa_sys as sys;
use nix::errno::Errno;
use nix::libc::{self, c_int, c_uint, pollfd};
use std::cell::Cell;
use std::ffi::CString;
use std::ptr;
use std::time::Duration;

fn check(rc: c_int) -> HwResult<c_int> {
    if rc < 0 { Err(HwError(rc)) } else { Ok(rc) }
}

fn nomem() -> HwError {
    HwError::from_errno(Errno::ENOMEM)
}

fn access_code(access: AccessMode) -> sys::snd_pcm_access_t {
    match access {
        AccessMode::MmapNonInterleaved => sys::SND_PCM_ACCESS_MMAP_NONINTERLEAVED,
        AccessMode::MmapInterleaved => sys::SND_PCM_ACCESS_MMAP_INTERLEAVED,
        AccessMode::MmapComplex => sys::SND_PCM_ACCESS_MMAP_COMPLEX,
    }
}

fn format_code(format: SampleFormat) -> sys::snd_pcm_format_t {
    match format {
        SampleFormat::FloatLe => sys::SND_PCM_FORMAT_FLOAT_LE,
        SampleFormat::S32Le => sys::SND_PCM_FORMAT_S32_LE,
        SampleFormat::S32Be => sys::SND_PCM_FORMAT_S32_BE,
        SampleFormat::S24_3Le => sys::SND_PCM_FORMAT_S24_3LE,
        SampleFormat::S24_3Be => sys::SND_PCM_FORMAT_S24_3BE,
        SampleFormat::S24Le => sys::SND_PCM_FORMAT_S24_LE,
        SampleFormat::S24Be => sys::SND_PCM_FORMAT_S24_BE,
        SampleFormat::S16Le => sys::SND_PCM_FORMAT_S16_LE,
        SampleFormat::S16Be => sys::SND_PCM_FORMAT_S16_BE,
    }
}

fn state_from(code: sys::snd_pcm_state_t) -> PcmState {
    match code {
        sys::SND_PCM_STATE_OPEN => PcmState::Open,
        sys::SND_PCM_STATE_SETUP => PcmState::Setup,
        sys::SND_PCM_STATE_PREPARED => PcmState::Prepared,
        sys::SND_PCM_STATE_RUNNING => PcmState::Running,
        sys::SND_PCM_STATE_XRUN => PcmState::XRun,
        sys::SND_PCM_STATE_DRAINING => PcmState::Draining,
        sys::SND_PCM_STATE_PAUSED => PcmState::Paused,
        sys::SND_PCM_STATE_SUSPENDED => PcmState::Suspended,
        _ => PcmState::Disconnected,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlsaBackend;

impl Backend for AlsaBackend {
    type Pcm = AlsaPcm;

    const LABEL: &'static str = "ALSA";
    const WORKER_THREAD_NAME: &'static str = "alsa-worker";

    fn open(&self, direction: Direction, device: &str) -> HwResult<AlsaPcm> {
        let name = CString::new(device).map_err(|_| HwError::from_errno(Errno::EINVAL))?;
        let stream = match direction {
            Direction::Playback => sys::SND_PCM_STREAM_PLAYBACK,
            Direction::Capture => sys::SND_PCM_STREAM_CAPTURE,
        };
        let mut handle = ptr::null_mut();
        check(unsafe { sys::snd_pcm_open(&mut handle, name.as_ptr(), stream, 0) })?;
        Ok(AlsaPcm {
            handle,
            direction,
            channels: Cell::new(0),
        })
    }

    fn link(&self, a: &AlsaPcm, b: &AlsaPcm) -> bool {
        unsafe { sys::snd_pcm_link(a.handle, b.handle) == 0 }
    }

    fn wait(&self, fds: &mut [pollfd], timeout: Duration) -> HwResult<WaitStatus> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let rc = unsafe {
            libc::ppoll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                &ts,
                ptr::null(),
            )
        };
        match rc {
            0 => Ok(WaitStatus::TimedOut),
            n if n > 0 => Ok(WaitStatus::Ready(n as usize)),
            _ => match Errno::last() {
                Errno::EINTR => Ok(WaitStatus::Interrupted),
                errno => Err(HwError::from_errno(errno)),
            },
        }
    }
}

/// An open `snd_pcm_t`, closed on drop.
#[derive(Debug)]
pub struct AlsaPcm {
    handle: *mut sys::snd_pcm_t,
    direction: Direction,
    /// Set once hardware parameters are installed.
    channels: Cell<u32>,
}

// The handle is only used by whichever thread currently owns the stream.
unsafe impl Send for AlsaPcm {}

impl Drop for AlsaPcm {
    fn drop(&mut self) {
        unsafe {
            sys::snd_pcm_close(self.handle);
        }
    }
}

impl PcmDevice for AlsaPcm {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn hw_params(&self) -> HwResult<Box<dyn HwParamSpace + '_>> {
        let mut params = ptr::null_mut();
        if unsafe { sys::snd_pcm_hw_params_malloc(&mut params) } < 0 || params.is_null() {
            return Err(nomem());
        }
        let space = AlsaHwParams { pcm: self, params };
        check(unsafe { sys::snd_pcm_hw_params_any(self.handle, params) })?;
        Ok(Box::new(space))
    }

    fn sw_params(&self) -> HwResult<Box<dyn SwParamSpace + '_>> {
        let mut params = ptr::null_mut();
        if unsafe { sys::snd_pcm_sw_params_malloc(&mut params) } < 0 || params.is_null() {
            return Err(nomem());
        }
        let space = AlsaSwParams { pcm: self, params };
        check(unsafe { sys::snd_pcm_sw_params_current(self.handle, params) })?;
        Ok(Box::new(space))
    }

    fn start(&self) -> HwResult<()> {
        check(unsafe { sys::snd_pcm_start(self.handle) }).map(drop)
    }

    fn drop_frames(&self) -> HwResult<()> {
        check(unsafe { sys::snd_pcm_drop(self.handle) }).map(drop)
    }

    fn prepare(&self) -> HwResult<()> {
        check(unsafe { sys::snd_pcm_prepare(self.handle) }).map(drop)
    }

    fn avail_update(&self) -> HwResult<usize> {
        let frames = unsafe { sys::snd_pcm_avail_update(self.handle) };
        if frames < 0 {
            return Err(HwError(frames as i32));
        }
        Ok(frames as usize)
    }

    fn status(&self) -> HwResult<PcmStatus> {
        let mut status = ptr::null_mut();
        if unsafe { sys::snd_pcm_status_malloc(&mut status) } < 0 || status.is_null() {
            return Err(nomem());
        }
        let status = StatusBuf(status);
        check(unsafe { sys::snd_pcm_status(self.handle, status.0) })?;
        let mut updated: sys::snd_timestamp_t = unsafe { std::mem::zeroed() };
        let mut trigger: sys::snd_timestamp_t = unsafe { std::mem::zeroed() };
        let state = unsafe {
            sys::snd_pcm_status_get_tstamp(status.0, &mut updated);
            sys::snd_pcm_status_get_trigger_tstamp(status.0, &mut trigger);
            sys::snd_pcm_status_get_state(status.0)
        };
        Ok(PcmStatus {
            state: state_from(state),
            trigger: Timestamp {
                sec: trigger.tv_sec as i64,
                usec: trigger.tv_usec as i64,
            },
            updated: Timestamp {
                sec: updated.tv_sec as i64,
                usec: updated.tv_usec as i64,
            },
        })
    }

    fn mmap_begin(&mut self, frames: usize, areas: &mut Vec<RawArea>) -> HwResult<MmapGrant> {
        let mut first: *const sys::snd_pcm_channel_area_t = ptr::null();
        let mut offset: sys::snd_pcm_uframes_t = 0;
        let mut granted = frames as sys::snd_pcm_uframes_t;
        check(unsafe {
            sys::snd_pcm_mmap_begin(self.handle, &mut first, &mut offset, &mut granted)
        })?;
        areas.clear();
        if !first.is_null() {
            for ch in 0..self.channels.get() as usize {
                // libasound hands out one area per channel, valid until commit.
                let area = unsafe { &*first.add(ch) };
                areas.push(unsafe { RawArea::new(area.addr.cast(), area.first, area.step) });
            }
        }
        Ok(MmapGrant {
            offset: offset as usize,
            frames: granted as usize,
        })
    }

    fn mmap_commit(&mut self, offset: usize, frames: usize) -> HwResult<usize> {
        let rc = unsafe {
            sys::snd_pcm_mmap_commit(
                self.handle,
                offset as sys::snd_pcm_uframes_t,
                frames as sys::snd_pcm_uframes_t,
            )
        };
        if rc < 0 {
            return Err(HwError(rc as i32));
        }
        Ok(rc as usize)
    }

    fn poll_descriptors(&self, fds: &mut Vec<pollfd>) -> HwResult<usize> {
        let count = check(unsafe { sys::snd_pcm_poll_descriptors_count(self.handle) })? as usize;
        let start = fds.len();
        fds.resize(
            start + count,
            pollfd {
                fd: -1,
                events: 0,
                revents: 0,
            },
        );
        let filled = check(unsafe {
            sys::snd_pcm_poll_descriptors(self.handle, fds[start..].as_mut_ptr().cast(), count as c_uint)
        })? as usize;
        fds.truncate(start + filled);
        Ok(filled)
    }

    fn poll_revents(&self, fds: &mut [pollfd]) -> HwResult<PollEvents> {
        let mut revents: libc::c_ushort = 0;
        check(unsafe {
            sys::snd_pcm_poll_descriptors_revents(
                self.handle,
                fds.as_mut_ptr().cast(),
                fds.len() as c_uint,
                &mut revents,
            )
        })?;
        Ok(PollEvents::from_revents(revents as i16))
    }
}

struct StatusBuf(*mut sys::snd_pcm_status_t);

impl Drop for StatusBuf {
    fn drop(&mut self) {
        unsafe { sys::snd_pcm_status_free(self.0) }
    }
}

struct AlsaHwParams<'a> {
    pcm: &'a AlsaPcm,
    params: *mut sys::snd_pcm_hw_params_t,
}

impl Drop for AlsaHwParams<'_> {
    fn drop(&mut self) {
        unsafe { sys::snd_pcm_hw_params_free(self.params) }
    }
}

impl HwParamSpace for AlsaHwParams<'_> {
    fn set_periods_integer(&mut self) -> HwResult<()> {
        let h = self.pcm.handle;
        check(unsafe { sys::snd_pcm_hw_params_set_periods_integer(h, self.params) }).map(drop)
    }

    fn set_access(&mut self, access: AccessMode) -> HwResult<()> {
        let h = self.pcm.handle;
        check(unsafe { sys::snd_pcm_hw_params_set_access(h, self.params, access_code(access)) })
            .map(drop)
    }

    fn set_format(&mut self, format: SampleFormat) -> HwResult<()> {
        let h = self.pcm.handle;
        check(unsafe { sys::snd_pcm_hw_params_set_format(h, self.params, format_code(format)) })
            .map(drop)
    }

    fn set_rate(&mut self, rate: u32) -> HwResult<()> {
        let h = self.pcm.handle;
        check(unsafe { sys::snd_pcm_hw_params_set_rate(h, self.params, rate, 0) }).map(drop)
    }

    fn channels_max(&self) -> HwResult<u32> {
        let mut max: c_uint = 0;
        check(unsafe { sys::snd_pcm_hw_params_get_channels_max(self.params, &mut max) })?;
        Ok(max)
    }

    fn set_channels(&mut self, channels: u32) -> HwResult<()> {
        let h = self.pcm.handle;
        check(unsafe { sys::snd_pcm_hw_params_set_channels(h, self.params, channels) }).map(drop)
    }

    fn set_period_size(&mut self, frames: usize) -> HwResult<()> {
        let h = self.pcm.handle;
        let frames = frames as sys::snd_pcm_uframes_t;
        check(unsafe { sys::snd_pcm_hw_params_set_period_size(h, self.params, frames, 0) })
            .map(drop)
    }

    fn set_periods(&mut self, periods: u32) -> HwResult<()> {
        let h = self.pcm.handle;
        check(unsafe { sys::snd_pcm_hw_params_set_periods(h, self.params, periods, 0) }).map(drop)
    }

    fn set_buffer_size(&mut self, frames: usize) -> HwResult<()> {
        let h = self.pcm.handle;
        let frames = frames as sys::snd_pcm_uframes_t;
        check(unsafe { sys::snd_pcm_hw_params_set_buffer_size(h, self.params, frames) }).map(drop)
    }

    fn install(&mut self) -> HwResult<()> {
        check(unsafe { sys::snd_pcm_hw_params(self.pcm.handle, self.params) })?;
        let mut channels: c_uint = 0;
        check(unsafe { sys::snd_pcm_hw_params_get_channels(self.params, &mut channels) })?;
        self.pcm.channels.set(channels);
        Ok(())
    }

    fn rate(&self) -> HwResult<(u32, i32)> {
        let (mut val, mut dir): (c_uint, c_int) = (0, 0);
        check(unsafe { sys::snd_pcm_hw_params_get_rate(self.params, &mut val, &mut dir) })?;
        Ok((val, dir))
    }

    fn period_size(&self) -> HwResult<(usize, i32)> {
        let (mut val, mut dir): (sys::snd_pcm_uframes_t, c_int) = (0, 0);
        check(unsafe { sys::snd_pcm_hw_params_get_period_size(self.params, &mut val, &mut dir) })?;
        Ok((val as usize, dir))
    }

    fn periods(&self) -> HwResult<(u32, i32)> {
        let (mut val, mut dir): (c_uint, c_int) = (0, 0);
        check(unsafe { sys::snd_pcm_hw_params_get_periods(self.params, &mut val, &mut dir) })?;
        Ok((val, dir))
    }

    fn format(&self) -> HwResult<SampleFormat> {
        let mut code: sys::snd_pcm_format_t = 0;
        check(unsafe { sys::snd_pcm_hw_params_get_format(self.params, &mut code) })?;
        SampleFormat::PREFERENCE
            .into_iter()
            .find(|f| format_code(*f) == code)
            .ok_or(HwError::from_errno(Errno::EINVAL))
    }

    fn access(&self) -> HwResult<AccessMode> {
        let mut code: sys::snd_pcm_access_t = 0;
        check(unsafe { sys::snd_pcm_hw_params_get_access(self.params, &mut code) })?;
        AccessMode::PREFERENCE
            .into_iter()
            .find(|a| access_code(*a) == code)
            .ok_or(HwError::from_errno(Errno::EINVAL))
    }
}

struct AlsaSwParams<'a> {
    pcm: &'a AlsaPcm,
    params: *mut sys::snd_pcm_sw_params_t,
}

impl Drop for AlsaSwParams<'_> {
    fn drop(&mut self) {
        unsafe { sys::snd_pcm_sw_params_free(self.params) }
    }
}

impl SwParamSpace for AlsaSwParams<'_> {
    fn set_tstamp_on_wakeup(&mut self) -> HwResult<()> {
        let h = self.pcm.handle;
        check(unsafe {
            sys::snd_pcm_sw_params_set_tstamp_mode(h, self.params, sys::SND_PCM_TSTAMP_ENABLE)
        })
        .map(drop)
    }

    fn set_avail_min(&mut self, frames: usize) -> HwResult<()> {
        let h = self.pcm.handle;
        let frames = frames as sys::snd_pcm_uframes_t;
        check(unsafe { sys::snd_pcm_sw_params_set_avail_min(h, self.params, frames) }).map(drop)
    }

    fn install(&mut self) -> HwResult<()> {
        check(unsafe { sys::snd_pcm_sw_params(self.pcm.handle, self.params) }).map(drop)
    }
}
