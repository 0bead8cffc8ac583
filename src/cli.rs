use crate::preset::Preset;
use clap::Parser;
use maolan_duplex_engine::RunConfig;
use maolan_duplex_engine::hw::MAX_CHANNELS;
use std::path::PathBuf;

/// Exercise a duplex sound card at the lowest practical latency.
///
/// Opens playback and capture, primes the playback ring with silence and
/// exchanges one period in each direction per hardware wakeup until the
/// run time is up or SIGINT arrives. Xruns are timed and recovered.
#[derive(Parser, Debug, Default)]
#[command(name = "maolan-duplex", version)]
pub struct Args {
    /// Capture device.
    #[arg(short = 'C', long, value_name = "DEVICE")]
    pub capture: Option<String>,

    /// Playback and capture device.
    #[arg(short = 'd', long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Playback device.
    #[arg(short = 'P', long, value_name = "DEVICE")]
    pub playback: Option<String>,

    /// Capture channels, 0 for all the device has.
    #[arg(short = 'i', long, allow_negative_numbers = true)]
    pub inchannels: Option<i64>,

    /// Playback channels, 0 for all the device has.
    #[arg(short = 'o', long, allow_negative_numbers = true)]
    pub outchannels: Option<i64>,

    /// Sample rate in Hz.
    #[arg(short = 'r', long, allow_negative_numbers = true)]
    pub rate: Option<i64>,

    /// Period size in frames.
    #[arg(short = 'p', long, allow_negative_numbers = true)]
    pub period: Option<i64>,

    /// Playback periods per cycle.
    #[arg(short = 'n', long = "nperiods", visible_alias = "play-periods", allow_negative_numbers = true)]
    pub play_periods: Option<i64>,

    /// Capture periods per cycle.
    #[arg(short = 'N', long = "capt-periods", visible_alias = "capt-nperiods", allow_negative_numbers = true)]
    pub capt_periods: Option<i64>,

    /// Seconds to run, 0 until interrupted.
    #[arg(short = 'L', long = "loop", value_name = "SECONDS")]
    pub run_for: Option<f32>,

    /// Realtime priority as an offset from the maximum (negative), or 0 for
    /// normal scheduling.
    #[arg(short = 'R', long, allow_negative_numbers = true)]
    pub priority: Option<i32>,

    /// Do not link the playback and capture clocks.
    #[arg(short = 'S', long)]
    pub no_sync: bool,

    /// Verbose per-cycle diagnostics.
    #[arg(short = 'D', long)]
    pub debug: bool,

    /// Open, configure and start the device, then idle without a worker.
    #[arg(long)]
    pub no_op: bool,

    /// Use the built-in simulated card instead of ALSA.
    #[arg(long)]
    pub simulate: bool,

    /// Restart attempts per xrun before giving up.
    #[arg(long, value_name = "N")]
    pub recovery_attempts: Option<u32>,

    /// TOML file with defaults; flags given here take precedence.
    #[arg(long, value_name = "FILE")]
    pub preset: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub config: RunConfig,
    pub no_op: bool,
    pub simulate: bool,
    pub recovery_attempts: u32,
}

fn channels(v: i64) -> u32 {
    if v < 0 { 0 } else { v.min(MAX_CHANNELS as i64) as u32 }
}

fn periods(v: i64) -> u32 {
    v.clamp(1, 32) as u32
}

fn period_frames(v: i64) -> usize {
    v.clamp(8, 8192) as usize
}

fn rate(v: i64) -> u32 {
    v.clamp(8_000, 192_000) as u32
}

impl Args {
    /// Flags over preset over built-in defaults, clamped into range.
    pub fn settings(&self, preset: &Preset) -> Settings {
        let defaults = RunConfig::default();
        let device = self.device.clone();
        let playback_device = self
            .playback
            .clone()
            .or_else(|| device.clone())
            .or_else(|| preset.playback_device.clone())
            .unwrap_or(defaults.playback_device);
        let capture_device = self
            .capture
            .clone()
            .or(device)
            .or_else(|| preset.capture_device.clone())
            .unwrap_or(defaults.capture_device);

        let config = RunConfig {
            playback_device,
            capture_device,
            sample_rate: self
                .rate
                .or(preset.sample_rate)
                .map(rate)
                .unwrap_or(defaults.sample_rate),
            period_frames: self
                .period
                .or(preset.period)
                .map(period_frames)
                .unwrap_or(defaults.period_frames),
            playback_periods: self
                .play_periods
                .or(preset.playback_periods)
                .map(periods)
                .unwrap_or(defaults.playback_periods),
            capture_periods: self
                .capt_periods
                .or(preset.capture_periods)
                .map(periods)
                .unwrap_or(defaults.capture_periods),
            playback_channels: self
                .outchannels
                .or(preset.playback_channels)
                .map(channels)
                .unwrap_or(defaults.playback_channels),
            capture_channels: self
                .inchannels
                .or(preset.capture_channels)
                .map(channels)
                .unwrap_or(defaults.capture_channels),
            run_for: self.run_for.or(preset.run_for).unwrap_or(defaults.run_for),
            priority: self.priority.or(preset.priority).unwrap_or(defaults.priority),
            link: !self.no_sync && preset.sync.unwrap_or(defaults.link),
            debug: self.debug || preset.debug.unwrap_or(defaults.debug),
        };

        Settings {
            config,
            no_op: self.no_op,
            simulate: self.simulate,
            recovery_attempts: self
                .recovery_attempts
                .or(preset.recovery_attempts)
                .unwrap_or(1)
                .max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(argv: &[&str]) -> Settings {
        let mut full = vec!["maolan-duplex"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full)
            .unwrap()
            .settings(&Preset::default())
    }

    #[test]
    fn defaults_match_run_config() {
        let s = settings(&[]);
        assert_eq!(s.config, RunConfig::default());
        assert_eq!(s.recovery_attempts, 1);
        assert!(!s.no_op);
    }

    #[test]
    fn values_are_clamped_into_range() {
        let s = settings(&[
            "-r", "1000", "-p", "4", "-n", "0", "-N", "40", "-i", "-3", "-o", "100",
        ]);
        assert_eq!(s.config.sample_rate, 8_000);
        assert_eq!(s.config.period_frames, 8);
        assert_eq!(s.config.playback_periods, 1);
        assert_eq!(s.config.capture_periods, 32);
        assert_eq!(s.config.capture_channels, 0);
        assert_eq!(s.config.playback_channels, 64);

        let s = settings(&["--rate", "400000", "--period", "100000"]);
        assert_eq!(s.config.sample_rate, 192_000);
        assert_eq!(s.config.period_frames, 8192);
    }

    #[test]
    fn device_flags() {
        let s = settings(&["-d", "hw:1", "-P", "hw:2"]);
        assert_eq!(s.config.playback_device, "hw:2");
        assert_eq!(s.config.capture_device, "hw:1");
    }

    #[test]
    fn long_aliases_and_switches() {
        let s = settings(&[
            "--play-periods",
            "3",
            "--capt-periods",
            "4",
            "-S",
            "-D",
            "-R",
            "-5",
            "-L",
            "0",
            "--no-op",
        ]);
        assert_eq!(s.config.playback_periods, 3);
        assert_eq!(s.config.capture_periods, 4);
        assert!(!s.config.link);
        assert!(s.config.debug);
        assert_eq!(s.config.priority, -5);
        assert_eq!(s.config.cycle_limit(), None);
        assert!(s.no_op);
    }

    #[test]
    fn flags_override_preset() {
        let preset = Preset {
            sample_rate: Some(44_100),
            period: Some(64),
            sync: Some(false),
            recovery_attempts: Some(0),
            ..Preset::default()
        };
        let args = Args::try_parse_from(["maolan-duplex", "-p", "256"]).unwrap();
        let s = args.settings(&preset);
        assert_eq!(s.config.sample_rate, 44_100);
        assert_eq!(s.config.period_frames, 256);
        assert!(!s.config.link);
        assert_eq!(s.recovery_attempts, 1);
    }
}
