use crate::error::{Error, HwError, Result};
use crate::hw::{
    AccessMode, Direction, HwParamSpace, MAX_CHANNELS, PcmDevice, SampleFormat, StreamRequest,
};
use crate::stream::{Negotiated, Stream};
use nix::errno::Errno;
use tracing::{debug, warn};

/// Negotiates hardware and software parameters for one opened direction.
///
/// Rate, period size and period count must come back exactly as requested;
/// anything else fails the configuration.
pub fn configure<P: PcmDevice>(pcm: P, request: &StreamRequest) -> Result<Stream<P>> {
    let params = negotiate_hw(&pcm, request)?;
    apply_sw(&pcm, request)?;
    debug!(
        "{}: {} ch, {} Hz, {}x{} frames, {} {}",
        request.direction,
        params.channels,
        params.sample_rate,
        params.periods,
        params.period_frames,
        params.format,
        params.access
    );
    Ok(Stream::new(pcm, params))
}

fn negotiate_hw<P: PcmDevice>(pcm: &P, request: &StreamRequest) -> Result<Negotiated> {
    let dir = request.direction;
    let cfg = |what: String| Error::config(dir, what);

    let mut hw = pcm.hw_params().map_err(|e| {
        space_error(dir, "hw params", e, "no hw configurations available")
    })?;
    hw.set_periods_integer()
        .map_err(|e| cfg(format!("cannot set period size to integral value: {e}")))?;

    let access = AccessMode::PREFERENCE
        .into_iter()
        .find(|access| hw.set_access(*access).is_ok())
        .ok_or_else(|| cfg("the interface doesn't support mmap-based access".to_string()))?;

    let format = SampleFormat::PREFERENCE
        .into_iter()
        .find(|format| hw.set_format(*format).is_ok())
        .ok_or_else(|| cfg("no supported sample format".to_string()))?;

    hw.set_rate(request.sample_rate).map_err(|e| {
        cfg(format!(
            "cannot set sample rate to {}: {e}",
            request.sample_rate
        ))
    })?;

    let max_channels = hw.channels_max().unwrap_or(0);
    let channels = resolve_channels(dir, request.channels, max_channels)?;
    hw.set_channels(channels)
        .map_err(|e| cfg(format!("cannot set channel count to {channels}: {e}")))?;

    hw.set_period_size(request.period_frames).map_err(|e| {
        cfg(format!(
            "cannot set period size to {}: {e}",
            request.period_frames
        ))
    })?;
    hw.set_periods(request.periods)
        .map_err(|e| cfg(format!("cannot set periods to {}: {e}", request.periods)))?;
    let buffer_frames = request.buffer_frames();
    hw.set_buffer_size(buffer_frames)
        .map_err(|e| cfg(format!("cannot set buffer length to {buffer_frames}: {e}")))?;
    hw.install()
        .map_err(|e| cfg(format!("cannot set hardware parameters: {e}")))?;

    verify(hw.as_ref(), request)?;

    let format = hw.format().unwrap_or(format);
    let access = hw.access().unwrap_or(access);
    Ok(Negotiated {
        sample_rate: request.sample_rate,
        period_frames: request.period_frames,
        periods: request.periods,
        channels,
        format,
        access,
    })
}

/// Allocation failures are resource errors, anything else a configuration
/// error.
fn space_error(dir: Direction, what: &'static str, e: HwError, reason: &str) -> Error {
    if e == HwError::from_errno(Errno::ENOMEM) {
        Error::Resource(what)
    } else {
        Error::config(dir, format!("{reason}: {e}"))
    }
}

/// `requested` 0 means the hardware maximum. More than the hard cap falls
/// back to stereo.
pub fn resolve_channels(dir: Direction, requested: u32, max_channels: u32) -> Result<u32> {
    let mut channels = if requested == 0 {
        max_channels
    } else {
        requested
    };
    if channels > MAX_CHANNELS {
        warn!("detected more than {MAX_CHANNELS} {dir} channels, reset to 2");
        channels = 2;
    }
    if channels < 1 {
        return Err(Error::config(dir, format!("invalid channel count {channels}")));
    }
    Ok(channels)
}

fn verify(hw: &dyn HwParamSpace, request: &StreamRequest) -> Result<()> {
    let dir = request.direction;
    match hw.rate() {
        Ok((rate, 0)) if rate == request.sample_rate => {}
        _ => return Err(Error::config(dir, "cannot get requested sample rate")),
    }
    match hw.period_size() {
        Ok((frames, 0)) if frames == request.period_frames => {}
        _ => return Err(Error::config(dir, "cannot get requested period size")),
    }
    match hw.periods() {
        Ok((periods, 0)) if periods == request.periods => {}
        _ => return Err(Error::config(dir, "cannot get requested number of periods")),
    }
    Ok(())
}

fn apply_sw<P: PcmDevice>(pcm: &P, request: &StreamRequest) -> Result<()> {
    let dir = request.direction;
    let mut sw = pcm
        .sw_params()
        .map_err(|e| space_error(dir, "sw params", e, "cannot get software parameters"))?;
    sw.set_tstamp_on_wakeup()
        .map_err(|e| Error::config(dir, format!("cannot set timestamp mode: {e}")))?;
    sw.set_avail_min(request.period_frames).map_err(|e| {
        Error::config(
            dir,
            format!("cannot set avail_min to {}: {e}", request.period_frames),
        )
    })?;
    sw.install()
        .map_err(|e| Error::config(dir, format!("cannot set software parameters: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_uses_hardware_maximum() {
        assert_eq!(resolve_channels(Direction::Capture, 0, 8).unwrap(), 8);
    }

    #[test]
    fn above_cap_falls_back_to_stereo() {
        assert_eq!(resolve_channels(Direction::Playback, 128, 128).unwrap(), 2);
        assert_eq!(resolve_channels(Direction::Playback, 0, 65).unwrap(), 2);
        assert_eq!(resolve_channels(Direction::Playback, 64, 128).unwrap(), 64);
    }

    #[test]
    fn no_channels_is_rejected() {
        let err = resolve_channels(Direction::Capture, 0, 0).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn allocation_failure_is_a_resource_error() {
        let nomem = HwError::from_errno(Errno::ENOMEM);
        let err = space_error(Direction::Playback, "hw params", nomem, "unused");
        assert!(matches!(err, Error::Resource("hw params")));
        let other = space_error(Direction::Playback, "hw params", HwError(-5), "no luck");
        assert!(other.to_string().starts_with("playback configuration: no luck"));
    }
}
