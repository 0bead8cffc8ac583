use crate::error::{Error, Result};
use crate::hw::{Backend, RunConfig, config};
use crate::recovery::XrunReport;
use crate::region::Payload;
use crate::rt::{self, Scheduling};
use crate::session::DuplexSession;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROFILE_INTERVAL: Duration = Duration::from_secs(1);

/// Raised once from outside the worker, read at every cycle boundary.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Safe to call from a signal handler.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Outer cycles, stalled ones included.
    pub cycles: u64,
    /// Capture/playback period pairs exchanged.
    pub periods: u64,
    pub timeouts: u64,
    pub async_waits: u64,
    pub xruns: Vec<XrunReport>,
    pub stopped_by_signal: bool,
}

#[derive(Debug)]
struct CycleProfiler {
    report_at: Instant,
    cycles: u64,
    periods: u64,
    stalls: u64,
    wait_time_ns: u128,
    work_time_ns: u128,
}

impl CycleProfiler {
    fn new() -> Self {
        Self {
            report_at: Instant::now() + PROFILE_INTERVAL,
            cycles: 0,
            periods: 0,
            stalls: 0,
            wait_time_ns: 0,
            work_time_ns: 0,
        }
    }

    fn maybe_report(&mut self, period_frames: usize, sample_rate: u32, label: &str) {
        let now = Instant::now();
        if now < self.report_at {
            return;
        }
        let avg_us = |ns: u128| {
            if self.cycles > 0 {
                (ns / self.cycles as u128) as f64 / 1_000.0
            } else {
                0.0
            }
        };
        let expected_cps = if period_frames > 0 {
            sample_rate as f64 / period_frames as f64
        } else {
            0.0
        };
        info!(
            "{} profile: expected_cps={:.1} cycles={} periods={} stalls={} wait_avg_us={:.1} work_avg_us={:.1}",
            label,
            expected_cps,
            self.cycles,
            self.periods,
            self.stalls,
            avg_us(self.wait_time_ns),
            avg_us(self.work_time_ns)
        );
        *self = Self {
            report_at: now + PROFILE_INTERVAL,
            ..Self::new()
        };
    }
}

/// The steady-state loop: wait, then drain whole periods until fewer than
/// one is available. Runs `limit` cycles, or until `stop` when `None`.
pub fn run<B: Backend>(
    session: &mut DuplexSession<B>,
    limit: Option<u64>,
    stop: &StopFlag,
    payload: &mut dyn Payload,
) -> Result<RunReport> {
    let period = session.period_frames();
    let mut profiler = config::env_flag(config::PROFILE_ENV).then(CycleProfiler::new);
    let mut report = RunReport::default();

    while limit.is_none_or(|end| report.cycles < end) {
        if stop.is_stopped() {
            report.stopped_by_signal = true;
            break;
        }

        let waited = Instant::now();
        let readiness = session.wait()?;
        let working = Instant::now();
        let mut frames = readiness.frames();
        if session.debug {
            debug!("proc: {frames}");
        }

        let mut exchanged = 0;
        while frames >= period {
            match session.transfer_period(payload) {
                Ok(()) => {
                    exchanged += 1;
                    frames -= period;
                }
                Err(e @ Error::Hardware { .. }) => {
                    warn!("{e}");
                    session.recover()?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        report.cycles += 1;
        report.periods += exchanged;

        if let Some(p) = profiler.as_mut() {
            p.cycles += 1;
            p.periods += exchanged;
            if exchanged == 0 {
                p.stalls += 1;
            }
            p.wait_time_ns += working.duration_since(waited).as_nanos();
            p.work_time_ns += working.elapsed().as_nanos();
            p.maybe_report(period, session.sample_rate(), B::LABEL);
        }
    }

    let stats = session.take_stats();
    report.timeouts = stats.timeouts;
    report.async_waits = stats.async_waits;
    report.xruns = stats.xruns;
    Ok(report)
}

/// Starts the session, runs the loop on the worker thread and stops the
/// session again whatever the loop returned.
pub fn run_session<B: Backend>(
    session: &mut DuplexSession<B>,
    config: &RunConfig,
    stop: &StopFlag,
    payload: &mut (dyn Payload + Send),
) -> Result<RunReport> {
    session.start()?;
    let limit = config.cycle_limit();
    let outcome = rt::launch(
        B::WORKER_THREAD_NAME,
        Scheduling::from_priority(config.priority),
        || run(session, limit, stop, payload),
    );
    let stopped = session.stop();
    let report = outcome??;
    stopped?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::Direction;
    use crate::hw::sim::{SimBackend, SimCaps, SimEvent, SimFaults};
    use crate::region::Silence;

    fn one_second() -> RunConfig {
        RunConfig {
            playback_device: "sim".to_string(),
            capture_device: "sim".to_string(),
            run_for: 1.0,
            priority: 0,
            ..RunConfig::default()
        }
    }

    fn session(faults: SimFaults) -> (SimBackend, DuplexSession<SimBackend>) {
        let backend = SimBackend::new(SimCaps::default(), faults);
        let session = DuplexSession::open(backend.clone(), &one_second()).unwrap();
        (backend, session)
    }

    #[test]
    fn one_second_runs_375_cycles() {
        let (_, mut session) = session(SimFaults::default());
        session.start().unwrap();
        let report = run(&mut session, Some(375), &StopFlag::new(), &mut Silence).unwrap();
        assert_eq!(report.cycles, 375);
        assert_eq!(report.periods, 375);
        assert!(report.xruns.is_empty());
        assert!(!report.stopped_by_signal);
        let capture = session.capture().unwrap().pcm();
        assert_eq!(capture.appl_ptr(), 375 * 128);
    }

    #[test]
    fn raised_flag_stops_before_the_first_cycle() {
        let (_, mut session) = session(SimFaults::default());
        session.start().unwrap();
        let stop = StopFlag::new();
        stop.stop();
        let report = run(&mut session, None, &stop, &mut Silence).unwrap();
        assert_eq!(report.cycles, 0);
        assert!(report.stopped_by_signal);
    }

    #[test]
    fn xrun_mid_run_recovers_and_keeps_counting() {
        let (_, mut session) = session(SimFaults {
            stall_at_wait: Some(100),
            ..SimFaults::default()
        });
        session.start().unwrap();
        let report = run(&mut session, Some(375), &StopFlag::new(), &mut Silence).unwrap();
        assert_eq!(report.cycles, 375);
        assert_eq!(report.periods, 374);
        assert_eq!(report.xruns.len(), 2);
        assert!(report.xruns.iter().all(|x| x.elapsed_ms >= 0.0));
        assert_eq!(report.xruns[0].direction, Direction::Playback);
    }

    #[test]
    fn timeouts_still_count_toward_the_deadline() {
        let (_, mut session) = session(SimFaults {
            timeout_at_wait: Some(3),
            ..SimFaults::default()
        });
        session.start().unwrap();
        let report = run(&mut session, Some(10), &StopFlag::new(), &mut Silence).unwrap();
        assert_eq!(report.cycles, 10);
        assert_eq!(report.periods, 9);
        assert_eq!(report.timeouts, 1);
    }

    #[test]
    fn run_session_stops_on_the_way_out() {
        let (backend, mut session) = session(SimFaults::default());
        let report = run_session(&mut session, &one_second(), &StopFlag::new(), &mut Silence)
            .unwrap();
        assert_eq!(report.cycles, 375);
        assert!(!session.is_running());
        let events = backend.events();
        assert_eq!(events.last(), Some(&SimEvent::Drop(Direction::Capture)));
    }

    #[test]
    fn failed_recovery_still_stops() {
        let (backend, mut session) = session(SimFaults {
            stall_at_wait: Some(5),
            fail_prepare: true,
            ..SimFaults::default()
        });
        let err = run_session(&mut session, &one_second(), &StopFlag::new(), &mut Silence)
            .unwrap_err();
        assert!(matches!(err, Error::Recovery { attempts: 1, .. }));
        assert!(!session.is_running());
        assert_eq!(backend.state(Direction::Playback), crate::hw::PcmState::Setup);
    }

    #[test]
    fn failed_capture_start_stops_playback() {
        let backend = SimBackend::new(
            SimCaps {
                link: false,
                ..SimCaps::default()
            },
            SimFaults::default(),
        );
        let mut session = DuplexSession::open(backend.clone(), &one_second()).unwrap();
        session.capture().unwrap().stop().unwrap();

        let err = run_session(&mut session, &one_second(), &StopFlag::new(), &mut Silence)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Hardware {
                direction: Direction::Capture,
                op: "pcm_start",
                ..
            }
        ));
        assert!(!session.is_running());
        assert_eq!(backend.state(Direction::Playback), crate::hw::PcmState::Setup);
        assert!(backend.events().contains(&SimEvent::Drop(Direction::Playback)));
    }

    #[derive(Default)]
    struct ThreadName(Option<String>);

    impl Payload for ThreadName {
        fn capture(&mut self, _region: &crate::region::PeriodRegion<'_>) {
            self.0 = std::thread::current().name().map(str::to_string);
        }
    }

    #[test]
    fn worker_thread_carries_the_backend_name() {
        let (_, mut session) = session(SimFaults::default());
        let config = RunConfig {
            run_for: 0.01,
            ..one_second()
        };
        let mut payload = ThreadName::default();
        run_session(&mut session, &config, &StopFlag::new(), &mut payload).unwrap();
        assert_eq!(payload.0.as_deref(), Some(SimBackend::WORKER_THREAD_NAME));
    }
}
