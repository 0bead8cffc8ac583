use super::Direction;

pub const DEFAULT_DEVICE: &str = "hw:MODDUO";

/// Everything a run asks of the hardware. Fixed before negotiation starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub playback_device: String,
    pub capture_device: String,
    pub sample_rate: u32,
    pub period_frames: usize,
    pub playback_periods: u32,
    pub capture_periods: u32,
    /// 0 picks the maximum the hardware offers.
    pub playback_channels: u32,
    pub capture_channels: u32,
    /// Seconds; 0 runs until stopped.
    pub run_for: f32,
    /// Negative enables realtime scheduling at that offset from the top.
    pub priority: i32,
    pub link: bool,
    pub debug: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            playback_device: DEFAULT_DEVICE.to_string(),
            capture_device: DEFAULT_DEVICE.to_string(),
            sample_rate: 48_000,
            period_frames: 128,
            playback_periods: 2,
            capture_periods: 2,
            playback_channels: 2,
            capture_channels: 2,
            run_for: 10.0,
            priority: -20,
            link: true,
            debug: false,
        }
    }
}

impl RunConfig {
    pub fn request(&self, direction: Direction) -> StreamRequest {
        let (periods, channels) = match direction {
            Direction::Playback => (self.playback_periods, self.playback_channels),
            Direction::Capture => (self.capture_periods, self.capture_channels),
        };
        StreamRequest {
            direction,
            sample_rate: self.sample_rate,
            period_frames: self.period_frames,
            periods,
            channels,
        }
    }

    pub fn device(&self, direction: Direction) -> &str {
        match direction {
            Direction::Playback => &self.playback_device,
            Direction::Capture => &self.capture_device,
        }
    }

    /// Outer cycles until the deadline, `None` when running until stopped.
    pub fn cycle_limit(&self) -> Option<u64> {
        if self.run_for <= 0.0 || self.period_frames == 0 {
            return None;
        }
        let cycles = self.run_for as f64 * self.sample_rate as f64 / self.period_frames as f64;
        Some(cycles as u64)
    }
}

/// The parameters one direction negotiates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub direction: Direction,
    pub sample_rate: u32,
    pub period_frames: usize,
    pub periods: u32,
    pub channels: u32,
}

impl StreamRequest {
    pub fn buffer_frames(&self) -> usize {
        self.period_frames * self.periods as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_second_at_48k_is_375_cycles_of_128() {
        let config = RunConfig {
            run_for: 1.0,
            ..RunConfig::default()
        };
        assert_eq!(config.cycle_limit(), Some(375));
    }

    #[test]
    fn zero_duration_runs_until_stopped() {
        let config = RunConfig {
            run_for: 0.0,
            ..RunConfig::default()
        };
        assert_eq!(config.cycle_limit(), None);
    }

    #[test]
    fn request_uses_per_direction_ring_depth() {
        let config = RunConfig {
            playback_periods: 3,
            capture_periods: 4,
            capture_channels: 8,
            ..RunConfig::default()
        };
        let capture = config.request(Direction::Capture);
        assert_eq!(capture.periods, 4);
        assert_eq!(capture.channels, 8);
        assert_eq!(capture.buffer_frames(), 512);
        assert_eq!(config.request(Direction::Playback).periods, 3);
    }
}
