use crate::error::{Error, Result};
use crate::hw::{Backend, Direction, PcmDevice, PcmState, PcmStatus};
use crate::session::DuplexSession;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How hard the session tries to get going again after an xrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Restart attempts per trigger. The first failure is fatal at 1.
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each one after.
    pub backoff: Duration,
    /// More recoveries than this inside `storm_window` end the run.
    pub storm_limit: usize,
    pub storm_window: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(10),
            storm_limit: 32,
            storm_window: Duration::from_secs(1),
        }
    }
}

impl RecoveryPolicy {
    /// Sleep before attempt `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << shift)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XrunReport {
    pub direction: Direction,
    pub elapsed_ms: f32,
}

/// Time between the xrun and the status query, or `None` when the stream
/// is not in the xrun state.
pub fn xrun_elapsed(status: &PcmStatus) -> Option<Duration> {
    if status.state != PcmState::XRun {
        return None;
    }
    let mut sec = status.updated.sec - status.trigger.sec;
    let mut usec = status.updated.usec - status.trigger.usec;
    if usec < 0 {
        usec += 1_000_000;
        sec -= 1;
    }
    if sec < 0 {
        return Some(Duration::ZERO);
    }
    Some(Duration::from_secs(sec as u64) + Duration::from_micros(usec as u64))
}

#[derive(Debug)]
pub(crate) struct RecoveryState {
    policy: RecoveryPolicy,
    recent: VecDeque<Instant>,
}

impl RecoveryState {
    pub(crate) fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            recent: VecDeque::with_capacity(policy.storm_limit + 1),
        }
    }

    fn note(&mut self, now: Instant) -> Result<()> {
        let window = self.policy.storm_window;
        while let Some(first) = self.recent.front() {
            if now.duration_since(*first) <= window {
                break;
            }
            self.recent.pop_front();
        }
        self.recent.push_back(now);
        if self.recent.len() > self.policy.storm_limit {
            return Err(Error::XrunStorm {
                count: self.recent.len(),
                window_ms: window.as_millis(),
            });
        }
        Ok(())
    }
}

impl<B: Backend> DuplexSession<B> {
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        self.recovery.policy
    }

    /// Reports how long each stream has been in xrun, then stops, prepares
    /// and restarts the session.
    pub fn recover(&mut self) -> Result<()> {
        debug!("recover");
        self.recovery.note(Instant::now())?;
        self.report_xruns();

        let policy = self.recovery.policy;
        let mut attempt = 1;
        loop {
            match self.restart(attempt) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!("recovery attempt {attempt} failed: {e}, retrying in {delay:?}");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::Recovery {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
            }
        }
    }

    fn restart(&mut self, attempt: u32) -> Result<()> {
        // A retry may find the streams already stopped.
        match self.stop() {
            Err(e) if attempt == 1 => return Err(e),
            Err(e) => debug!("stop before retry: {e}"),
            Ok(()) => {}
        }
        self.prepare()?;
        self.start()
    }

    fn report_xruns(&mut self) {
        for (direction, stream) in [
            (Direction::Playback, &self.playback),
            (Direction::Capture, &self.capture),
        ] {
            let Some(stream) = stream else {
                continue;
            };
            let status = match stream.pcm().status() {
                Ok(status) => status,
                Err(e) => {
                    warn!("{direction} pcm_status: {e}");
                    continue;
                }
            };
            if let Some(elapsed) = xrun_elapsed(&status) {
                let elapsed_ms = elapsed.as_secs_f32() * 1000.0;
                warn!("{direction} x-run {elapsed_ms:.2} ms");
                self.stats.xruns.push(XrunReport {
                    direction,
                    elapsed_ms,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{SimBackend, SimCaps, SimEvent, SimFaults};
    use crate::hw::{RunConfig, Timestamp};

    fn config() -> RunConfig {
        RunConfig {
            playback_device: "sim".to_string(),
            capture_device: "sim".to_string(),
            ..RunConfig::default()
        }
    }

    fn status(state: PcmState, trigger: (i64, i64), updated: (i64, i64)) -> PcmStatus {
        PcmStatus {
            state,
            trigger: Timestamp {
                sec: trigger.0,
                usec: trigger.1,
            },
            updated: Timestamp {
                sec: updated.0,
                usec: updated.1,
            },
        }
    }

    #[test]
    fn elapsed_borrows_from_seconds() {
        let s = status(PcmState::XRun, (5, 900_000), (6, 100_000));
        assert_eq!(xrun_elapsed(&s), Some(Duration::from_millis(200)));
    }

    #[test]
    fn elapsed_is_never_negative() {
        let s = status(PcmState::XRun, (7, 0), (6, 500_000));
        assert_eq!(xrun_elapsed(&s), Some(Duration::ZERO));
    }

    #[test]
    fn running_stream_has_no_xrun_time() {
        let s = status(PcmState::Running, (1, 0), (2, 0));
        assert_eq!(xrun_elapsed(&s), None);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
    }

    #[test]
    fn stops_before_preparing_and_restarting() {
        let backend = SimBackend::new(
            SimCaps::default(),
            SimFaults {
                stall_at_wait: Some(1),
                ..SimFaults::default()
            },
        );
        let mut session = DuplexSession::open(backend.clone(), &config()).unwrap();
        session.start().unwrap();
        let before = backend.events().len();
        assert_eq!(
            session.wait().unwrap(),
            crate::poll::Readiness::Stalled(crate::poll::Stall::Recovered)
        );

        let events = backend.events().split_off(before);
        let last_drop = events
            .iter()
            .rposition(|e| matches!(e, SimEvent::Drop(_)))
            .unwrap();
        let first_prepare = events
            .iter()
            .position(|e| matches!(e, SimEvent::Prepare(_)))
            .unwrap();
        let last_prepare = events
            .iter()
            .rposition(|e| matches!(e, SimEvent::Prepare(_)))
            .unwrap();
        let first_start = events
            .iter()
            .position(|e| matches!(e, SimEvent::Start(_)))
            .unwrap();
        assert!(last_drop < first_prepare);
        assert!(last_prepare < first_start);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SimEvent::Drop(_)))
                .count(),
            2
        );

        let xruns = &session.stats().xruns;
        assert_eq!(xruns.len(), 2);
        for report in xruns {
            assert!(report.elapsed_ms >= 0.0);
            assert!((report.elapsed_ms - 2.667).abs() < 0.05, "{report:?}");
        }
    }

    #[test]
    fn failed_restart_gives_up_after_budget() {
        let backend = SimBackend::new(
            SimCaps::default(),
            SimFaults {
                fail_prepare: true,
                ..SimFaults::default()
            },
        );
        let policy = RecoveryPolicy {
            max_attempts: 3,
            backoff: Duration::ZERO,
            ..RecoveryPolicy::default()
        };
        let mut session = DuplexSession::open(backend, &config())
            .unwrap()
            .with_recovery_policy(policy);
        assert_eq!(session.recovery_policy(), policy);
        session.start().unwrap();
        match session.recover() {
            Err(Error::Recovery { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("pcm_prepare"), "{last}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn repeated_recoveries_are_a_storm() {
        let policy = RecoveryPolicy {
            storm_limit: 2,
            storm_window: Duration::from_secs(60),
            ..RecoveryPolicy::default()
        };
        let mut session = DuplexSession::open(SimBackend::default(), &config())
            .unwrap()
            .with_recovery_policy(policy);
        session.start().unwrap();
        session.recover().unwrap();
        session.recover().unwrap();
        assert!(matches!(
            session.recover(),
            Err(Error::XrunStorm { count: 3, .. })
        ));
    }
}
