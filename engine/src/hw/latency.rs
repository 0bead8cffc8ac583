/// Nominal latency of a duplex run, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    pub capture: usize,
    pub playback: usize,
}

impl Latency {
    pub fn round_trip(&self) -> usize {
        self.capture + self.playback
    }

    pub fn millis(frames: usize, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        frames as f64 * 1000.0 / sample_rate as f64
    }
}

/// A period has to fill before capture sees it; playback sits behind the
/// primed ring, plus one period of slack when the clocks are not linked.
pub fn latency(
    period_frames: usize,
    capture_enabled: bool,
    playback_periods: Option<u32>,
    linked: bool,
) -> Latency {
    let capture = if capture_enabled { period_frames } else { 0 };
    let playback = match playback_periods {
        Some(nperiods) => {
            let mut frames = nperiods.max(1) as usize * period_frames;
            if !linked {
                frames += period_frames;
            }
            frames
        }
        None => 0,
    };
    Latency { capture, playback }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linked_duplex_round_trip() {
        let l = latency(128, true, Some(2), true);
        assert_eq!(l, Latency { capture: 128, playback: 256 });
        assert_eq!(l.round_trip(), 384);
        assert_eq!(Latency::millis(l.round_trip(), 48_000), 8.0);
    }

    #[test]
    fn unlinked_adds_a_period_of_slack() {
        let l = latency(64, true, Some(3), false);
        assert_eq!(l.playback, 256);
    }

    #[test]
    fn capture_only() {
        let l = latency(256, true, None, false);
        assert_eq!(l.round_trip(), 256);
    }
}
