use crate::error::{HwError, Result};
use crate::hw::{Backend, Direction, PcmDevice, PollEvents, WaitStatus};
use crate::session::DuplexSession;
use nix::libc::POLLERR;
use std::time::Duration;
use tracing::{debug, warn};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a wait made no progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    TimedOut,
    Interrupted,
    PollFailed,
    Recovered,
}

/// Result of one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Frames both enabled streams can exchange.
    Frames(usize),
    Stalled(Stall),
}

impl Readiness {
    pub fn frames(&self) -> usize {
        match self {
            Readiness::Frames(frames) => *frames,
            Readiness::Stalled(_) => 0,
        }
    }
}

impl<B: Backend> DuplexSession<B> {
    /// Blocks until every enabled stream is ready, then reports the smaller
    /// of the two available counts.
    ///
    /// An error flag on either descriptor set or a failing availability
    /// query runs recovery and reports no progress. Only a failed recovery
    /// is returned as an error.
    pub fn wait(&mut self) -> Result<Readiness> {
        let mut need_playback = self.playback.is_some();
        let mut need_capture = self.capture.is_some();

        while need_playback || need_capture {
            self.fds.clear();
            let mut split = 0;
            if need_playback && let Some(playback) = self.playback.as_ref() {
                match playback.pcm().poll_descriptors(&mut self.fds) {
                    Ok(count) => split = count,
                    Err(e) => {
                        warn!("cannot get playback pollfds: {e}");
                        self.recover()?;
                        return Ok(Readiness::Stalled(Stall::Recovered));
                    }
                }
            }
            if need_capture && let Some(capture) = self.capture.as_ref() {
                if let Err(e) = capture.pcm().poll_descriptors(&mut self.fds) {
                    warn!("cannot get capture pollfds: {e}");
                    self.recover()?;
                    return Ok(Readiness::Stalled(Stall::Recovered));
                }
            }
            for fd in &mut self.fds {
                fd.events |= POLLERR;
                fd.revents = 0;
            }

            match self.wait_backend() {
                Ok(WaitStatus::Ready(_)) => {}
                Ok(WaitStatus::TimedOut) => {
                    warn!("poll timed out");
                    self.stats.timeouts += 1;
                    return Ok(Readiness::Stalled(Stall::TimedOut));
                }
                Ok(WaitStatus::Interrupted) => {
                    return Ok(Readiness::Stalled(Stall::Interrupted));
                }
                Err(e) => {
                    warn!("poll failed: {e}");
                    return Ok(Readiness::Stalled(Stall::PollFailed));
                }
            }

            if need_playback {
                let events = self.revents(Direction::Playback, split);
                if events.error {
                    warn!("error on playback pollfd");
                    self.recover()?;
                    return Ok(Readiness::Stalled(Stall::Recovered));
                }
                if events.writable {
                    need_playback = false;
                }
            }
            if need_capture {
                let events = self.revents(Direction::Capture, split);
                if events.error {
                    warn!("error on capture pollfd");
                    self.recover()?;
                    return Ok(Readiness::Stalled(Stall::Recovered));
                }
                if events.readable {
                    need_capture = false;
                }
            }
        }

        let playback = match self.avail_of(Direction::Playback) {
            Ok(frames) => frames,
            Err(e) => {
                debug!("playback avail: {e}");
                self.recover()?;
                return Ok(Readiness::Stalled(Stall::Recovered));
            }
        };
        let capture = match self.avail_of(Direction::Capture) {
            Ok(frames) => frames,
            Err(e) => {
                debug!("capture avail: {e}");
                self.recover()?;
                return Ok(Readiness::Stalled(Stall::Recovered));
            }
        };

        if let (Some(playback), Some(capture)) = (playback, capture)
            && playback != capture
        {
            self.stats.async_waits += 1;
            if self.debug {
                warn!("async avail playback:{playback} capture:{capture}");
            }
        }

        let frames = match (playback, capture) {
            (Some(p), Some(c)) => p.min(c),
            (Some(p), None) => p,
            (None, Some(c)) => c,
            (None, None) => 0,
        };
        Ok(Readiness::Frames(frames))
    }

    /// Playback descriptors come first in `fds`, capture ones after `split`.
    fn revents(&mut self, direction: Direction, split: usize) -> PollEvents {
        let (stream, fds) = match direction {
            Direction::Playback => {
                let end = split.min(self.fds.len());
                (self.playback.as_ref(), &mut self.fds[..end])
            }
            Direction::Capture => {
                let start = split.min(self.fds.len());
                (self.capture.as_ref(), &mut self.fds[start..])
            }
        };
        let Some(stream) = stream else {
            return PollEvents::default();
        };
        stream.pcm().poll_revents(fds).unwrap_or_else(|e| {
            warn!("{direction} poll revents: {e}");
            PollEvents {
                error: true,
                ..PollEvents::default()
            }
        })
    }

    fn avail_of(&self, direction: Direction) -> std::result::Result<Option<usize>, HwError> {
        let stream = match direction {
            Direction::Playback => self.playback.as_ref(),
            Direction::Capture => self.capture.as_ref(),
        };
        stream.map(|s| s.avail()).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::RunConfig;
    use crate::hw::sim::{SimBackend, SimCaps, SimFaults};

    fn config() -> RunConfig {
        RunConfig {
            playback_device: "sim".to_string(),
            capture_device: "sim".to_string(),
            ..RunConfig::default()
        }
    }

    fn started(faults: SimFaults) -> DuplexSession<SimBackend> {
        let backend = SimBackend::new(SimCaps::default(), faults);
        let mut session = DuplexSession::open(backend, &config()).unwrap();
        session.start().unwrap();
        session
    }

    #[test]
    fn reports_one_period_when_both_ready() {
        let mut session = started(SimFaults::default());
        assert_eq!(session.wait().unwrap(), Readiness::Frames(128));
        assert_eq!(session.stats().async_waits, 0);
    }

    #[test]
    fn progress_is_the_smaller_availability() {
        let mut session = started(SimFaults {
            capture_skew: 32,
            ..SimFaults::default()
        });
        let frames = session.wait().unwrap().frames();
        let playback = session.playback().unwrap().avail().unwrap();
        let capture = session.capture().unwrap().avail().unwrap();
        assert_eq!(capture, 160);
        assert_eq!(frames, playback.min(capture));
        assert_eq!(frames, 128);
        assert_eq!(session.stats().async_waits, 1);
    }

    #[test]
    fn single_direction_reports_its_own_availability() {
        let mut session = started(SimFaults {
            missing: vec![Direction::Capture],
            ..SimFaults::default()
        });
        let frames = session.wait().unwrap().frames();
        assert_eq!(frames, session.playback().unwrap().avail().unwrap());
    }

    #[test]
    fn timeout_yields_no_progress() {
        let mut session = started(SimFaults {
            timeout_at_wait: Some(1),
            ..SimFaults::default()
        });
        assert_eq!(
            session.wait().unwrap(),
            Readiness::Stalled(Stall::TimedOut)
        );
        assert_eq!(session.stats().timeouts, 1);
        assert_eq!(session.wait().unwrap(), Readiness::Frames(128));
    }

    #[test]
    fn error_flag_recovers_and_yields_no_progress() {
        let mut session = started(SimFaults {
            poll_error_at_wait: Some((Direction::Playback, 1)),
            ..SimFaults::default()
        });
        assert_eq!(
            session.wait().unwrap(),
            Readiness::Stalled(Stall::Recovered)
        );
        assert!(session.is_running());
        // No xrun happened, so nothing to time.
        assert!(session.stats().xruns.is_empty());
        assert_eq!(session.wait().unwrap(), Readiness::Frames(128));
    }

    #[test]
    fn error_on_capture_descriptor_recovers() {
        let mut session = started(SimFaults {
            poll_error_at_wait: Some((Direction::Capture, 1)),
            ..SimFaults::default()
        });
        assert_eq!(
            session.wait().unwrap(),
            Readiness::Stalled(Stall::Recovered)
        );
        assert!(session.is_running());
        assert!(session.stats().xruns.is_empty());
        assert_eq!(session.wait().unwrap(), Readiness::Frames(128));
    }

    #[test]
    fn failed_descriptor_lookup_recovers() {
        for direction in [Direction::Playback, Direction::Capture] {
            let mut session = started(SimFaults {
                descriptors_fail_at_wait: Some((direction, 1)),
                ..SimFaults::default()
            });
            assert_eq!(
                session.wait().unwrap(),
                Readiness::Stalled(Stall::Recovered),
                "{direction}"
            );
            assert!(session.is_running());
            assert_eq!(session.wait().unwrap(), Readiness::Frames(128), "{direction}");
        }
    }
}
