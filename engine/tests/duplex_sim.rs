//! End-to-end runs against the simulated card.

use maolan_duplex_engine::hw::sim::{SimBackend, SimCaps, SimEvent, SimFaults};
use maolan_duplex_engine::hw::{AccessMode, Backend, Direction, SampleFormat};
use maolan_duplex_engine::{
    DuplexSession, Error, Payload, PeriodRegion, RunConfig, StopFlag, configure, run,
    run_session,
};
use std::time::Duration;

fn config() -> RunConfig {
    RunConfig {
        playback_device: "sim".to_string(),
        capture_device: "sim".to_string(),
        run_for: 1.0,
        priority: 0,
        ..RunConfig::default()
    }
}

#[derive(Default)]
struct Tone {
    captured: usize,
    played: usize,
}

impl Payload for Tone {
    fn capture(&mut self, region: &PeriodRegion<'_>) {
        assert_eq!(region.direction(), Direction::Capture);
        self.captured += region.frames();
    }

    fn playback(&mut self, region: &mut PeriodRegion<'_>) {
        region.silence();
        for frame in 0..region.frames() {
            assert!(region.set_sample(0, frame, 0.5));
            assert!(region.set_sample(1, frame, -0.25));
        }
        let back = region.sample(0, 0).unwrap();
        assert!((back - 0.5).abs() < 1e-3, "{back}");
        assert!(!region.set_sample(2, 0, 1.0));
        assert!(!region.set_sample(0, region.frames(), 1.0));
        self.played += region.frames();
    }
}

#[test]
fn one_second_of_duplex_io() {
    let backend = SimBackend::default();
    let mut session = DuplexSession::open(backend.clone(), &config()).unwrap();
    let mut tone = Tone::default();
    let report = run_session(&mut session, &config(), &StopFlag::new(), &mut tone).unwrap();

    assert_eq!(report.cycles, 375);
    assert_eq!(report.periods, 375);
    assert_eq!(report.timeouts, 0);
    assert!(report.xruns.is_empty());
    assert_eq!(tone.captured, 375 * 128);
    assert_eq!(tone.played, 375 * 128);
    assert_eq!(backend.clock(), 375 * 128);
}

#[test]
fn interleaved_sixteen_bit_card() {
    let caps = SimCaps {
        formats: vec![SampleFormat::S16Be, SampleFormat::S16Le],
        access: vec![AccessMode::MmapInterleaved],
        ..SimCaps::default()
    };
    let backend = SimBackend::new(caps, SimFaults::default());
    let mut session = DuplexSession::open(backend, &config()).unwrap();
    let params = *session.playback().unwrap().params();
    assert_eq!(params.format, SampleFormat::S16Le);
    assert_eq!(params.access, AccessMode::MmapInterleaved);

    session.start().unwrap();
    let mut tone = Tone::default();
    run(&mut session, Some(1), &StopFlag::new(), &mut tone).unwrap();

    // Frame 0 of the first played period sits at the start of the ring.
    let ring = session.playback().unwrap().pcm().ring();
    let left = SampleFormat::S16Le.decode(&ring[0..2]);
    let right = SampleFormat::S16Le.decode(&ring[2..4]);
    assert!((left - 0.5).abs() < 1e-3, "{left}");
    assert!((right + 0.25).abs() < 1e-3, "{right}");
    // The second period is still primed silence.
    assert!(ring[128 * 4..].iter().all(|b| *b == 0));
}

#[test]
fn oversized_channel_request_falls_back_to_stereo() {
    let caps = SimCaps {
        max_channels: 128,
        ..SimCaps::default()
    };
    let config = RunConfig {
        playback_channels: 128,
        capture_channels: 0,
        ..config()
    };
    let backend = SimBackend::new(caps, SimFaults::default());
    let session = DuplexSession::open(backend, &config).unwrap();
    assert_eq!(session.playback().unwrap().channels(), 2);
    // Auto picks the card maximum, which is over the cap as well.
    assert_eq!(session.capture().unwrap().channels(), 2);
}

#[test]
fn auto_channels_use_the_card_maximum() {
    let caps = SimCaps {
        max_channels: 8,
        ..SimCaps::default()
    };
    let config = RunConfig {
        capture_channels: 0,
        ..config()
    };
    let session = DuplexSession::open(SimBackend::new(caps, SimFaults::default()), &config).unwrap();
    assert_eq!(session.capture().unwrap().channels(), 8);
    assert_eq!(session.playback().unwrap().channels(), 2);
}

#[test]
fn card_without_link_support_runs_unsynced() {
    let caps = SimCaps {
        link: false,
        ..SimCaps::default()
    };
    let backend = SimBackend::new(caps, SimFaults::default());
    let mut session = DuplexSession::open(backend.clone(), &config()).unwrap();
    assert!(!session.is_linked());
    let config = RunConfig {
        run_for: 0.5,
        ..config()
    };
    let report = run_session(
        &mut session,
        &config,
        &StopFlag::new(),
        &mut maolan_duplex_engine::Silence,
    )
    .unwrap();
    assert_eq!(report.cycles, 187);
    let starts = backend
        .events()
        .into_iter()
        .filter(|e| matches!(e, SimEvent::Start(_)))
        .count();
    assert_eq!(starts, 2);
}

#[test]
fn capture_only_run() {
    let faults = SimFaults {
        missing: vec![Direction::Playback],
        ..SimFaults::default()
    };
    let backend = SimBackend::new(SimCaps::default(), faults);
    let mut session = DuplexSession::open(backend, &config()).unwrap();
    let mut tone = Tone::default();
    let report = run_session(&mut session, &config(), &StopFlag::new(), &mut tone).unwrap();
    assert_eq!(report.periods, 375);
    assert_eq!(tone.played, 0);
    assert_eq!(tone.captured, 375 * 128);
}

#[test]
fn stall_is_recovered_and_the_run_completes() {
    let faults = SimFaults {
        stall_at_wait: Some(200),
        ..SimFaults::default()
    };
    let backend = SimBackend::new(SimCaps::default(), faults);
    let mut session = DuplexSession::open(backend, &config()).unwrap();
    let report = run_session(
        &mut session,
        &config(),
        &StopFlag::new(),
        &mut maolan_duplex_engine::Silence,
    )
    .unwrap();
    assert_eq!(report.cycles, 375);
    assert_eq!(report.periods, 374);
    let directions: Vec<_> = report.xruns.iter().map(|x| x.direction).collect();
    assert_eq!(directions, vec![Direction::Playback, Direction::Capture]);
    assert!(report.xruns.iter().all(|x| x.elapsed_ms > 0.0));
}

#[test]
fn stop_flag_ends_an_open_ended_run() {
    let backend = SimBackend::default().realtime(true);
    let mut session = DuplexSession::open(backend, &config()).unwrap();
    let config = RunConfig {
        run_for: 0.0,
        ..config()
    };
    let stop = StopFlag::new();
    let raiser = stop.clone();
    let watcher = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        raiser.stop();
    });
    let report = run_session(
        &mut session,
        &config,
        &stop,
        &mut maolan_duplex_engine::Silence,
    )
    .unwrap();
    watcher.join().unwrap();
    assert!(report.stopped_by_signal);
    assert!(!session.is_running());
}

#[test]
fn region_commit_discipline() {
    let backend = SimBackend::default();
    let pcm = backend.open(Direction::Playback, "sim").unwrap();
    let mut stream = configure(pcm, &config().request(Direction::Playback)).unwrap();

    // Asking to commit more than was granted commits nothing.
    let region = stream.begin(128).unwrap();
    assert!(matches!(
        region.commit_frames(200),
        Err(Error::Hardware { op: "mmap_commit", .. })
    ));
    assert_eq!(stream.pcm().appl_ptr(), 0);

    // An abandoned region is released without moving the pointer.
    drop(stream.begin(128).unwrap());
    assert_eq!(stream.pcm().appl_ptr(), 0);

    let region = stream.begin(128).unwrap();
    assert_eq!(region.offset(), 0);
    assert_eq!(region.commit_frames(64).unwrap(), 64);
    let region = stream.begin(128).unwrap();
    assert_eq!(region.offset(), 64);
    assert_eq!(region.frames(), 128);
    region.commit().unwrap();
    assert_eq!(stream.pcm().appl_ptr(), 192);

    // Near the end of the ring the grant stops at the wrap point.
    stream.start().unwrap();
    backend.wait(&mut [], Duration::from_secs(1)).unwrap();
    let region = stream.begin(128).unwrap();
    assert_eq!(region.offset(), 192);
    assert_eq!(region.frames(), 64);
    region.commit().unwrap();
    assert_eq!(stream.begin(128).unwrap().offset(), 0);
}
