use crate::configure::configure;
use crate::error::{Error, Result};
use crate::hw::{Backend, Direction, RunConfig};
use crate::recovery::{RecoveryPolicy, RecoveryState, XrunReport};
use crate::region::Payload;
use crate::stream::Stream;
use nix::libc::pollfd;
use tracing::{debug, error, info, warn};

/// Counters the session keeps while the worker drives it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub timeouts: u64,
    /// Waits where both streams reported different availability.
    pub async_waits: u64,
    pub xruns: Vec<XrunReport>,
}

/// Zero, one or two streams and whether their clocks are linked.
///
/// With linked clocks every lifecycle command goes through playback only;
/// the driver carries it over to capture.
pub struct DuplexSession<B: Backend> {
    backend: B,
    pub(crate) playback: Option<Stream<B::Pcm>>,
    pub(crate) capture: Option<Stream<B::Pcm>>,
    linked: bool,
    period_frames: usize,
    sample_rate: u32,
    pub(crate) debug: bool,
    running: bool,
    pub(crate) fds: Vec<pollfd>,
    pub(crate) recovery: RecoveryState,
    pub(crate) stats: SessionStats,
}

impl<B: Backend> DuplexSession<B> {
    /// Opens and configures both directions. A direction that fails to open
    /// is disabled for the run; failing to configure an opened one is fatal.
    pub fn open(backend: B, config: &RunConfig) -> Result<Self> {
        let open = |direction: Direction| {
            let device = config.device(direction);
            match backend.open(direction, device) {
                Ok(pcm) => Some(pcm),
                Err(e) => {
                    error!("{}: cannot open {direction} device '{device}': {e}", B::LABEL);
                    None
                }
            }
        };
        let playback_pcm = open(Direction::Playback);
        let capture_pcm = open(Direction::Capture);
        if playback_pcm.is_none() && capture_pcm.is_none() {
            return Err(Error::NoDevices);
        }

        let playback = playback_pcm
            .map(|pcm| configure(pcm, &config.request(Direction::Playback)))
            .transpose()?;
        let capture = capture_pcm
            .map(|pcm| configure(pcm, &config.request(Direction::Capture)))
            .transpose()?;

        let linked = match (&playback, &capture) {
            (Some(p), Some(c)) if config.link => backend.link(p.pcm(), c.pcm()),
            _ => false,
        };
        debug!("{}: streams {}", B::LABEL, if linked { "linked" } else { "independent" });

        Ok(Self {
            backend,
            playback,
            capture,
            linked,
            period_frames: config.period_frames,
            sample_rate: config.sample_rate,
            debug: config.debug,
            running: false,
            fds: Vec::with_capacity(4),
            recovery: RecoveryState::new(RecoveryPolicy::default()),
            stats: SessionStats::default(),
        })
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = RecoveryState::new(policy);
        self
    }

    pub fn playback(&self) -> Option<&Stream<B::Pcm>> {
        self.playback.as_ref()
    }

    pub fn capture(&self) -> Option<&Stream<B::Pcm>> {
        self.capture.as_ref()
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn period_frames(&self) -> usize {
        self.period_frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub(crate) fn take_stats(&mut self) -> SessionStats {
        std::mem::take(&mut self.stats)
    }

    /// Primes the playback ring with silence and starts the hardware. A
    /// failure part way through stops whatever was already started.
    pub fn start(&mut self) -> Result<()> {
        if let Err(e) = self.start_streams() {
            if let Err(stop) = self.stop() {
                warn!("{}: stop after failed start: {stop}", B::LABEL);
            }
            return Err(e);
        }
        self.running = true;
        Ok(())
    }

    fn start_streams(&mut self) -> Result<()> {
        if let Some(playback) = self.playback.as_mut() {
            let expected = playback.buffer_frames();
            let available = playback
                .avail()
                .map_err(|e| Error::hw(Direction::Playback, "avail_update", e))?;
            if available != expected {
                return Err(Error::RingNotFull {
                    available,
                    expected,
                });
            }
            let period = playback.period_frames();
            for _ in 0..playback.params().periods {
                let mut region = playback.begin(period)?;
                region.silence();
                region.commit()?;
            }
            playback.start()?;
        }
        if let Some(capture) = self.capture.as_ref()
            && !self.linked
        {
            capture.start()?;
        }
        Ok(())
    }

    /// Stops both directions even if the first one fails; the first error
    /// wins.
    pub fn stop(&mut self) -> Result<()> {
        self.running = false;
        let playback = self.playback.as_ref().map_or(Ok(()), |p| p.stop());
        let capture = match self.capture.as_ref() {
            Some(capture) if !self.linked => capture.stop(),
            _ => Ok(()),
        };
        playback.and(capture)
    }

    pub(crate) fn prepare(&mut self) -> Result<()> {
        if let Some(playback) = self.playback.as_ref() {
            playback.prepare()?;
        }
        if let Some(capture) = self.capture.as_ref()
            && !self.linked
        {
            capture.prepare()?;
        }
        Ok(())
    }

    /// One capture and one playback period. Absent directions are skipped.
    pub(crate) fn transfer_period(&mut self, payload: &mut dyn Payload) -> Result<()> {
        let period = self.period_frames;
        if let Some(capture) = self.capture.as_mut() {
            let region = capture.begin(period)?;
            payload.capture(&region);
            region.commit()?;
        }
        if let Some(playback) = self.playback.as_mut() {
            let mut region = playback.begin(period)?;
            payload.playback(&mut region);
            region.commit()?;
        }
        Ok(())
    }

    pub(crate) fn wait_backend(&mut self) -> crate::hw::HwResult<crate::hw::WaitStatus> {
        self.backend.wait(&mut self.fds, crate::poll::WAIT_TIMEOUT)
    }

    /// One line per enabled direction plus the sync state.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (direction, stream) in [
            (Direction::Playback, &self.playback),
            (Direction::Capture, &self.capture),
        ] {
            match stream {
                Some(stream) => {
                    let p = stream.params();
                    lines.push(format!("{direction}:"));
                    lines.push(format!("  channels   : {}", p.channels));
                    lines.push(format!("  samplerate : {}", p.sample_rate));
                    lines.push(format!("  buffersize : {}", p.period_frames));
                    lines.push(format!("  periods    : {}", p.periods));
                    lines.push(format!("  format     : {}", p.format));
                    lines.push(format!("  access     : {}", p.access));
                }
                None => lines.push(format!("{direction}: not enabled")),
            }
        }
        if self.playback.is_some() && self.capture.is_some() {
            lines.push(if self.linked { "synced" } else { "not synced" }.to_string());
        }
        lines
    }
}

impl<B: Backend> Drop for DuplexSession<B> {
    fn drop(&mut self) {
        if !self.running {
            return;
        }
        if let Err(e) = self.stop() {
            error!("{}: stop on close failed: {e}", B::LABEL);
        } else {
            info!("{}: stopped on close", B::LABEL);
        }
    }
}
