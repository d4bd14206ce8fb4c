use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use rma_shared::{
    engine::{self, TimingRecord},
    fabric::loopback::LoopbackFabric,
    memory_region::{AlignedBuffer, RegionMemory},
    BenchError, BenchParams, ConfigError, Fabric, Report, Result, Role, RunConfig, Session,
    Threading, TransferHandle,
};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    Layer,
};

fn config(
    threads: usize,
    window_size: usize,
    num_messages: usize,
    message_size: usize,
) -> RunConfig {
    RunConfig::new(BenchParams {
        threads,
        window_size,
        num_messages: Some(num_messages),
        message_size,
    })
    .unwrap()
}

/// Counts WARN events seen by the subscriber it is layered into.
#[derive(Clone, Default)]
struct WarnCount(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for WarnCount {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Runs both ranks through `Session`, counting the warnings the source logs
/// on the calling thread.
fn run_counting_warnings(config: &RunConfig) -> (TimingRecord, usize) {
    let (source, sink) = LoopbackFabric::pair();
    let warnings = WarnCount::default();
    let subscriber = tracing_subscriber::registry().with(warnings.clone());

    let record = thread::scope(|s| {
        let sink_rank = s.spawn(|| -> Result<()> {
            let session = Session::establish(&sink, config)?;
            session.execute()?;
            session.teardown().map(|_| ())
        });

        let record = tracing::subscriber::with_default(subscriber, || -> Result<TimingRecord> {
            let session = Session::establish(&source, config)?;
            let record = session.execute()?;
            session.teardown()?;
            Ok(record)
        })
        .unwrap();

        sink_rank.join().unwrap().unwrap();
        record
    });

    (record, warnings.0.load(Ordering::SeqCst))
}

/// Runs both ranks of `pair` and returns their outcomes plus whatever the
/// source printed.
fn run_pair(
    (source, sink): &(LoopbackFabric, LoopbackFabric),
    config: &RunConfig,
) -> (Result<Option<Report>>, Result<Option<Report>>, String) {
    let mut out = Vec::new();
    let (source_outcome, sink_outcome) = thread::scope(|s| {
        let sink_rank = s.spawn(|| engine::run(sink, config, &mut io::sink()));
        let source_outcome = engine::run(source, config, &mut out);
        (source_outcome, sink_rank.join().unwrap())
    });
    (source_outcome, sink_outcome, String::from_utf8(out).unwrap())
}

#[test]
fn two_threads_print_two_rows_and_a_summary() {
    let pair = LoopbackFabric::pair();
    let config = config(2, 64, 128, 8);
    assert_eq!(config.num_messages(), 64);

    let (source, sink, printed) = run_pair(&pair, &config);

    let report = source.unwrap().unwrap();
    assert!(sink.unwrap().is_none());

    assert_eq!(report.lanes.len(), 2);
    assert_eq!(report.message_size, 8);
    assert_eq!(report.num_threads, 2);
    assert!(report.lanes.iter().all(|lane| lane.msg_rate > 0.0));

    let lines: Vec<&str> = printed.lines().collect();
    assert_eq!(lines.len(), 6);
    assert!(lines[0].starts_with("Thread"));
    assert!(lines[1].starts_with("0 "));
    assert!(lines[2].starts_with("1 "));
    assert!(lines[4].starts_with("Size"));
    assert!(lines[5].starts_with("8         \t2         \t"));
}

#[test]
fn uneven_count_is_truncated_to_whole_windows() {
    let config = config(1, 64, 100, 8);
    assert_eq!(config.num_messages(), 64);
    assert!(config.is_truncated());

    let (record, warnings) = run_counting_warnings(&config);
    assert_eq!(warnings, 1);

    let timing = record.get(0).unwrap();
    assert_eq!(timing.warmup_puts, 64);
    assert_eq!(timing.timed_puts, 64);
}

#[test]
fn whole_windows_run_without_a_warning() {
    let config = config(2, 64, 128, 8);
    assert!(!config.is_truncated());

    let (record, warnings) = run_counting_warnings(&config);
    assert_eq!(warnings, 0);

    for lane in 0..2 {
        let timing = record.get(lane).unwrap();
        assert_eq!(timing.warmup_puts, 64);
        assert_eq!(timing.timed_puts, 64);
    }
}

#[test]
fn every_lane_writes_only_its_own_slot() {
    const THREADS: usize = 4;
    const SIZE: usize = 16;

    let (source, sink) = LoopbackFabric::pair();
    let config = config(THREADS, 8, THREADS * 32, SIZE);

    let (record, region) = thread::scope(|s| {
        let sink_rank = s.spawn(|| -> Result<Option<AlignedBuffer>> {
            let session = Session::establish(&sink, &config)?;
            assert_eq!(session.role(), Role::Sink);
            session.execute()?;
            session.teardown()
        });

        let session = Session::establish(&source, &config).unwrap();
        assert_eq!(session.role(), Role::Source);
        let record = session.execute().unwrap();
        assert!(session.teardown().unwrap().is_none());

        (record, sink_rank.join().unwrap().unwrap())
    });

    for lane in 0..THREADS {
        let timing = record.get(lane).unwrap();
        assert_eq!(timing.warmup_puts, 32);
        assert_eq!(timing.timed_puts, 32);
    }

    let region = region.unwrap();
    assert_eq!(region.len(), THREADS * SIZE);
    for lane in 0..THREADS {
        let slot = &region.as_slice()[config.slot(lane)];
        assert!(slot.iter().all(|&byte| byte == lane as u8), "slot {lane}: {slot:?}");
    }
}

#[test]
fn repeated_runs_tear_down_completely() {
    let pair = LoopbackFabric::pair();
    let config = config(3, 16, 3 * 64, 64);

    for run in 1..=3 {
        let (source, sink, printed) = run_pair(&pair, &config);
        source.unwrap().unwrap();
        sink.unwrap();
        assert_eq!(printed.lines().count(), 7);

        assert_eq!(pair.0.exposed_regions(), 0);
        assert_eq!(pair.0.handles_created(), run);
        assert_eq!(pair.1.handles_created(), run);
    }
}

#[test]
fn three_processes_are_rejected() {
    let world = LoopbackFabric::world(3);
    let config = config(1, 64, 640, 8);

    for rank in &world {
        assert!(matches!(
            engine::run(rank, &config, &mut io::sink()),
            Err(BenchError::WorldSize(3))
        ));
    }
}

#[test]
fn missing_thread_support_is_rejected() {
    let world = LoopbackFabric::world_with_threading(2, Threading::Serialized);
    let config = config(2, 64, 640, 8);

    for rank in &world {
        assert!(matches!(
            engine::run(rank, &config, &mut io::sink()),
            Err(BenchError::ThreadSupport(Threading::Serialized))
        ));
    }
}

#[test]
fn too_few_messages_fail_before_setup() {
    let params = BenchParams {
        threads: 4,
        window_size: 64,
        num_messages: Some(100),
        message_size: 8,
    };
    assert!(matches!(
        RunConfig::new(params),
        Err(ConfigError::TooFewMessages {
            requested: 100,
            threads: 4,
            window_size: 64,
        })
    ));
}

#[test]
fn puts_respect_the_access_epoch_and_lane_slots() {
    let (source, sink) = LoopbackFabric::pair();
    let config = config(2, 64, 128, 8);

    thread::scope(|s| {
        let sink_rank = s.spawn(|| {
            let region = sink.allocate_region(config.region_len()).unwrap();
            let handle = sink.create_handle(Some(region), &config).unwrap();
            let origin = AlignedBuffer::filled(8, 1).unwrap();

            assert!(matches!(handle.put(1, &origin, 8), Err(BenchError::NoAccessEpoch)));
            handle.lock_all().unwrap();
            assert!(matches!(handle.put(1, &origin, 8), Err(BenchError::NoRemoteRegion)));
            handle.unlock_all().unwrap();

            sink.barrier().unwrap();
            handle.release().unwrap().unwrap()
        });

        let handle = source.create_handle(None, &config).unwrap();
        let origin = AlignedBuffer::filled(8, 7).unwrap();

        assert!(matches!(handle.put(0, &origin, 0), Err(BenchError::NoAccessEpoch)));
        assert!(matches!(handle.flush(0), Err(BenchError::NoAccessEpoch)));

        handle.lock_all().unwrap();
        assert!(matches!(handle.lock_all(), Err(BenchError::AccessEpochOpen)));

        assert!(matches!(
            handle.put(0, &origin, 8),
            Err(BenchError::OutsideLaneSlot { lane: 0, offset: 8, len: 8 })
        ));
        assert!(matches!(
            handle.put(1, &origin, 4),
            Err(BenchError::OutsideLaneSlot { lane: 1, .. })
        ));
        assert!(matches!(
            handle.put(2, &origin, 16),
            Err(BenchError::InvalidLane { lane: 2, lanes: 2 })
        ));

        let oversized = AlignedBuffer::filled(16, 7).unwrap();
        assert!(matches!(
            handle.put(0, &oversized, 0),
            Err(BenchError::OutsideLaneSlot { .. })
        ));

        handle.put(1, &origin, 8).unwrap();
        handle.flush(1).unwrap();
        handle.unlock_all().unwrap();

        assert!(handle.release().unwrap().is_none());
        source.barrier().unwrap();

        let region = sink_rank.join().unwrap();
        assert_eq!(&region.as_slice()[..8], &[0; 8]);
        assert_eq!(&region.as_slice()[8..], &[7; 8]);
    });
}

#[test]
fn abort_releases_a_waiting_peer() {
    let (source, sink) = LoopbackFabric::pair();
    let config = config(2, 64, 128, 8);

    thread::scope(|s| {
        let sink_rank = s.spawn(|| engine::run(&sink, &config, &mut io::sink()));
        source.abort();
        assert!(matches!(sink_rank.join().unwrap(), Err(BenchError::PeerAborted)));
    });
}

/// Creates a sink handle over a fresh region and a source handle targeting
/// it.
fn handle_pair(
    (source, sink): &(LoopbackFabric, LoopbackFabric),
    config: &RunConfig,
) -> (
    <LoopbackFabric as Fabric>::Handle,
    <LoopbackFabric as Fabric>::Handle,
) {
    thread::scope(|s| {
        let sink_rank = s.spawn(|| {
            let region = sink.allocate_region(config.region_len()).unwrap();
            sink.create_handle(Some(region), config).unwrap()
        });
        let source_handle = source.create_handle(None, config).unwrap();
        (source_handle, sink_rank.join().unwrap())
    })
}

#[test]
fn sink_region_stays_alive_while_a_source_targets_it() {
    let pair = LoopbackFabric::pair();
    let config = config(1, 64, 64, 64);
    let (source_handle, sink_handle) = handle_pair(&pair, &config);

    assert!(matches!(sink_handle.release(), Err(BenchError::RegionInUse(1))));
    assert_eq!(pair.1.exposed_regions(), 0);

    let origin = AlignedBuffer::filled(64, 0xee).unwrap();
    source_handle.lock_all().unwrap();
    source_handle.put(0, &origin, 0).unwrap();
    source_handle.flush(0).unwrap();
    source_handle.unlock_all().unwrap();
    assert!(source_handle.release().unwrap().is_none());
}

#[test]
fn sink_gets_its_region_back_once_the_source_lets_go() {
    let pair = LoopbackFabric::pair();
    let config = config(1, 64, 64, 64);
    let (source_handle, sink_handle) = handle_pair(&pair, &config);

    let origin = AlignedBuffer::filled(64, 0xee).unwrap();
    source_handle.lock_all().unwrap();
    source_handle.put(0, &origin, 0).unwrap();
    source_handle.flush(0).unwrap();
    source_handle.unlock_all().unwrap();
    assert!(source_handle.release().unwrap().is_none());

    let region = sink_handle.release().unwrap().unwrap();
    assert!(region.as_slice().iter().all(|&byte| byte == 0xee));
    assert_eq!(pair.1.exposed_regions(), 0);
}

#[test]
fn dropping_a_sink_handle_withdraws_its_exposure() {
    let pair = LoopbackFabric::pair();
    let config = config(1, 64, 64, 64);
    let (source_handle, sink_handle) = handle_pair(&pair, &config);
    assert_eq!(pair.0.exposed_regions(), 1);

    drop(sink_handle);
    assert_eq!(pair.0.exposed_regions(), 0);

    let origin = AlignedBuffer::filled(64, 1).unwrap();
    source_handle.lock_all().unwrap();
    source_handle.put(0, &origin, 0).unwrap();
    source_handle.flush(0).unwrap();
}

#[test]
fn failed_lanes_detach_their_origin_buffers() {
    let (source, sink) = LoopbackFabric::pair();
    let config = config(2, 8, 2 * 32, 8);

    thread::scope(|s| {
        let sink_rank = s.spawn(|| -> Result<()> {
            let session = Session::establish(&sink, &config)?;
            session.execute().map(|_| ())
        });

        let session = Session::establish(&source, &config).unwrap();
        session.handle().unlock_all().unwrap();

        assert!(matches!(session.execute(), Err(BenchError::NoAccessEpoch)));
        assert_eq!(session.handle().attached_origins(), 0);

        source.abort();
        assert!(matches!(sink_rank.join().unwrap(), Err(BenchError::PeerAborted)));
    });
}
