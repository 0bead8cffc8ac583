mod cli;
mod logging;
mod preset;
mod signal;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, Settings};
use maolan_duplex_engine::hw::latency::{Latency, latency};
use maolan_duplex_engine::hw::{Backend, config};
use maolan_duplex_engine::{DuplexSession, RecoveryPolicy, Silence, StopFlag, run_session};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let args = Args::parse();
    let preset = args.preset.as_deref().map(preset::load).transpose();
    let preset_debug = matches!(&preset, Ok(Some(p)) if p.debug == Some(true));
    logging::init(args.debug || preset_debug || config::env_flag(config::DEBUG_ENV));

    let outcome = preset.and_then(|preset| {
        let settings = args.settings(&preset.unwrap_or_default());
        run(&settings)
    });
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(settings: &Settings) -> Result<()> {
    if settings.simulate {
        return drive(
            maolan_duplex_engine::hw::sim::SimBackend::default().realtime(true),
            settings,
        );
    }
    #[cfg(target_os = "linux")]
    {
        drive(maolan_duplex_engine::hw::alsa::AlsaBackend, settings)
    }
    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("ALSA is only available on Linux, try --simulate")
    }
}

fn drive<B: Backend>(backend: B, settings: &Settings) -> Result<()> {
    let config = &settings.config;
    let policy = RecoveryPolicy {
        max_attempts: settings.recovery_attempts,
        ..RecoveryPolicy::default()
    };
    let mut session = DuplexSession::open(backend, config)
        .with_context(|| format!("cannot set up {} devices", B::LABEL))?
        .with_recovery_policy(policy);

    for line in session.describe() {
        println!("{line}");
    }
    print_latency(&session);

    let stop = StopFlag::new();
    signal::install(stop.clone())?;

    if settings.no_op {
        session.start()?;
        idle(config.run_for, &stop);
        session.stop()?;
        return Ok(());
    }

    let report = run_session(&mut session, config, &stop, &mut Silence)?;
    println!(
        "cycles: {}  periods: {}  xruns: {}  timeouts: {}",
        report.cycles,
        report.periods,
        report.xruns.len(),
        report.timeouts
    );
    for xrun in &report.xruns {
        println!("  {} x-run {:.2} ms", xrun.direction, xrun.elapsed_ms);
    }
    if report.async_waits > 0 {
        warn!("{} waits saw uneven availability", report.async_waits);
    }
    if report.stopped_by_signal {
        info!("interrupted");
    }
    Ok(())
}

fn print_latency<B: Backend>(session: &DuplexSession<B>) {
    let rate = session.sample_rate();
    let lat: Latency = latency(
        session.period_frames(),
        session.capture().is_some(),
        session.playback().map(|p| p.params().periods),
        session.is_linked(),
    );
    println!(
        "latency    : capture {} + playback {} = {} frames ({:.2} ms)",
        lat.capture,
        lat.playback,
        lat.round_trip(),
        Latency::millis(lat.round_trip(), rate)
    );
}

/// Keeps the started device open without touching it.
fn idle(run_for: f32, stop: &StopFlag) {
    let deadline = (run_for > 0.0).then(|| Instant::now() + Duration::from_secs_f32(run_for));
    while !stop.is_stopped() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
