//! The per-thread windowed put loop and the run that wraps it.
//!
//! Each source thread issues `window_size` puts into its own slot of the
//! sink region and then one flush, for `windows` windows. It does this once
//! to warm up and once under the clock. Sink threads only take part in the
//! two collective rendezvous around the timed phase.

use std::{io::Write, panic, sync::OnceLock, thread, time::Duration};

use crossbeam::utils::CachePadded;
use quanta::Clock;
use tracing::{debug, info, warn};

use crate::{
    barrier::SpinBarrier,
    config::RunConfig,
    error::{BenchError, Result},
    fabric::{Fabric, Threading, TransferHandle},
    memory_region::AlignedBuffer,
    report::Report,
    role::Role,
};

/// What one source thread measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneTiming {
    pub elapsed: Duration,
    pub warmup_puts: usize,
    pub timed_puts: usize,
}

/// One write-once slot per thread, read after the parallel region joins.
#[derive(Debug)]
pub struct TimingRecord {
    slots: Box<[CachePadded<OnceLock<LaneTiming>>]>,
}

impl TimingRecord {
    pub fn new(lanes: usize) -> Self {
        Self {
            slots: (0..lanes).map(|_| CachePadded::new(OnceLock::new())).collect(),
        }
    }

    pub fn store(&self, lane: usize, timing: LaneTiming) -> Result<()> {
        let slot = self.slots.get(lane).ok_or(BenchError::InvalidLane {
            lane,
            lanes: self.slots.len(),
        })?;
        slot.set(timing)
            .map_err(|_| BenchError::TimingSlotReused(lane))
    }

    pub fn get(&self, lane: usize) -> Option<&LaneTiming> {
        self.slots.get(lane).and_then(|slot| slot.get())
    }

    /// Elapsed time of every lane, failing on the first lane that never
    /// recorded one.
    pub fn elapsed(&self) -> Result<Vec<Duration>> {
        (0..self.slots.len())
            .map(|lane| {
                self.get(lane)
                    .map(|timing| timing.elapsed)
                    .ok_or(BenchError::MissingTiming(lane))
            })
            .collect()
    }
}

/// Collective synchronisation point inside the parallel region: thread 0
/// runs the process-wide barrier, all threads of the process then meet.
#[derive(Debug)]
pub struct Rendezvous {
    threads: usize,
    local: SpinBarrier,
}

impl Rendezvous {
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            local: SpinBarrier::new(),
        }
    }

    pub fn collective(&self, lane: usize, world_barrier: impl FnOnce() -> Result<()>) -> Result<()> {
        if lane == 0 {
            if let Err(err) = world_barrier() {
                self.abort();
                return Err(err);
            }
        }
        self.local.wait(self.threads).map_err(|_| BenchError::Aborted)
    }

    /// Releases sibling threads blocked in, or later arriving at, a
    /// rendezvous.
    pub fn abort(&self) {
        self.local.abort();
    }
}

/// Aborts the rendezvous if the worker unwinds, so siblings do not wait on
/// a thread that will never arrive.
struct AbortOnUnwind<'a>(&'a Rendezvous);

impl Drop for AbortOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// Detaches a lane's origin buffer however the lane exits, before the buffer
/// itself is freed.
struct AttachedOrigin<'h, H: TransferHandle> {
    handle: &'h H,
    lane: usize,
}

impl<H: TransferHandle> Drop for AttachedOrigin<'_, H> {
    fn drop(&mut self) {
        if let Err(err) = self.handle.detach_origin(self.lane) {
            warn!(lane = self.lane, %err, "failed to detach origin buffer");
        }
    }
}

/// Every error except the ones reporting someone else's failure wins.
fn root_cause(current: Option<BenchError>, next: BenchError) -> Option<BenchError> {
    match current {
        Some(current) if !current.is_secondary() || next.is_secondary() => Some(current),
        _ => Some(next),
    }
}

fn check_environment<F: Fabric>(fabric: &F) -> Result<()> {
    if fabric.size() != 2 {
        return Err(BenchError::WorldSize(fabric.size()));
    }
    if fabric.threading() != Threading::Multiple {
        return Err(BenchError::ThreadSupport(fabric.threading()));
    }
    Ok(())
}

/// One process's part of a benchmark run, from memory setup to teardown.
pub struct Session<'a, F: Fabric> {
    fabric: &'a F,
    config: &'a RunConfig,
    role: Role,
    handle: F::Handle,
}

impl<'a, F: Fabric> Session<'a, F> {
    /// Assigns the role, sets up memory and creates the transfer handle.
    /// Collective: both processes must call it.
    pub fn establish(fabric: &'a F, config: &'a RunConfig) -> Result<Self> {
        check_environment(fabric)?;

        let role = Role::from_rank(fabric.rank());
        info!(rank = fabric.rank(), %role, "assigned role");

        let region = if role.exposes_region() {
            let region = fabric.allocate_region(config.region_len())?;
            info!(len = config.region_len(), "exposing region");
            Some(region)
        } else {
            None
        };

        let handle = fabric.create_handle(region, config)?;

        if role == Role::Source {
            handle.lock_all()?;
        }

        Ok(Self {
            fabric,
            config,
            role,
            handle,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn handle(&self) -> &F::Handle {
        &self.handle
    }

    /// Runs the parallel region: one thread per lane, warm-up, collective,
    /// timed phase, collective.
    pub fn execute(&self) -> Result<TimingRecord> {
        let threads = self.config.num_threads();

        if self.role == Role::Source && self.config.is_truncated() {
            warn!(
                requested = self.config.requested_messages(),
                per_thread = self.config.num_messages(),
                threads,
                "message count is not a multiple of window size times threads; \
                 the reported numbers are computed from the truncated count"
            );
        }

        info!(
            role = %self.role,
            threads,
            windows = self.config.windows(),
            window_size = self.config.window_size(),
            "starting put lanes"
        );

        let record = TimingRecord::new(threads);
        let rendezvous = Rendezvous::new(threads);

        thread::scope(|scope| {
            let mut workers = Vec::with_capacity(threads);

            for lane in 0..threads {
                let record = &record;
                let rendezvous = &rendezvous;

                let spawned = thread::Builder::new()
                    .name(format!("put-lane-{lane}"))
                    .spawn_scoped(scope, move || {
                        let _guard = AbortOnUnwind(rendezvous);
                        let outcome = match self.role {
                            Role::Source => self.source_lane(lane, rendezvous, record),
                            Role::Sink => self.sink_lane(lane, rendezvous),
                        };
                        if outcome.is_err() {
                            rendezvous.abort();
                        }
                        outcome
                    });

                match spawned {
                    Ok(worker) => workers.push(worker),
                    Err(err) => {
                        rendezvous.abort();
                        return Err(BenchError::from(err));
                    }
                }
            }

            let mut failure = None;
            for worker in workers {
                match worker.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => failure = root_cause(failure, err),
                    Err(payload) => panic::resume_unwind(payload),
                }
            }

            failure.map_or(Ok(()), Err)
        })?;

        Ok(record)
    }

    fn source_lane(&self, lane: usize, rendezvous: &Rendezvous, record: &TimingRecord) -> Result<()> {
        let scratch = AlignedBuffer::filled(self.config.message_size(), lane as u8)?;
        self.handle.attach_origin(lane, &scratch)?;
        let _attached = AttachedOrigin {
            handle: &self.handle,
            lane,
        };

        let target_disp = self.config.target_offset(lane);
        let clock = Clock::new();

        let warmup_puts = self.post_windows(lane, &scratch, target_disp)?;
        debug!(lane, warmup_puts, "warm-up done");

        rendezvous.collective(lane, || self.fabric.barrier())?;

        let start = clock.now();
        let timed_puts = self.post_windows(lane, &scratch, target_disp)?;
        let elapsed = clock.now() - start;

        record.store(
            lane,
            LaneTiming {
                elapsed,
                warmup_puts,
                timed_puts,
            },
        )?;
        debug!(lane, timed_puts, ?elapsed, "timed phase done");

        rendezvous.collective(lane, || self.fabric.barrier())
    }

    fn sink_lane(&self, lane: usize, rendezvous: &Rendezvous) -> Result<()> {
        rendezvous.collective(lane, || self.fabric.barrier())?;
        rendezvous.collective(lane, || self.fabric.barrier())
    }

    /// Issues `windows` windows of puts, flushing after each. Returns the
    /// number of puts issued.
    fn post_windows(&self, lane: usize, scratch: &AlignedBuffer, target_disp: usize) -> Result<usize> {
        let mut issued = 0;
        for _ in 0..self.config.windows() {
            for _ in 0..self.config.window_size() {
                self.handle.put(lane, scratch, target_disp)?;
                issued += 1;
            }
            self.handle.flush(lane)?;
        }
        Ok(issued)
    }

    /// Closes the access epoch and drops the source's handle, meets the
    /// peer once more so no remote access is outstanding, then releases the
    /// sink's handle. Returns the sink's region.
    pub fn teardown(self) -> Result<Option<F::Region>> {
        let rank = self.fabric.rank();

        let region = match self.role {
            Role::Source => {
                self.handle.unlock_all()?;
                let region = self.handle.release()?;
                self.fabric.barrier()?;
                region
            }
            Role::Sink => {
                self.fabric.barrier()?;
                self.handle.release()?
            }
        };

        info!(rank, "released transfer handle");
        Ok(region)
    }
}

/// Runs the whole benchmark for this process and writes the report to `out`
/// on the source. Any failure aborts the peer as well.
pub fn run<F: Fabric>(fabric: &F, config: &RunConfig, out: &mut dyn Write) -> Result<Option<Report>> {
    let outcome = run_session(fabric, config, out);
    if outcome.is_err() {
        fabric.abort();
    }
    outcome
}

fn run_session<F: Fabric>(fabric: &F, config: &RunConfig, out: &mut dyn Write) -> Result<Option<Report>> {
    let session = Session::establish(fabric, config)?;
    let record = session.execute()?;
    let role = session.role();
    let region = session.teardown()?;

    let report = match role {
        Role::Source => {
            let report = Report::new(config, &record.elapsed()?);
            write!(out, "{report}")?;
            out.flush()?;
            Some(report)
        }
        Role::Sink => None,
    };

    fabric.barrier()?;
    drop(region);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn timing(ms: u64) -> LaneTiming {
        LaneTiming {
            elapsed: Duration::from_millis(ms),
            warmup_puts: 64,
            timed_puts: 64,
        }
    }

    #[test]
    fn timing_slots_are_write_once() {
        let record = TimingRecord::new(2);
        record.store(1, timing(3)).unwrap();
        assert!(matches!(
            record.store(1, timing(4)),
            Err(BenchError::TimingSlotReused(1))
        ));
        assert!(matches!(
            record.store(2, timing(4)),
            Err(BenchError::InvalidLane { lane: 2, lanes: 2 })
        ));
        assert!(matches!(record.elapsed(), Err(BenchError::MissingTiming(0))));

        record.store(0, timing(5)).unwrap();
        assert_eq!(
            record.elapsed().unwrap(),
            vec![Duration::from_millis(5), Duration::from_millis(3)]
        );
    }

    #[test]
    fn only_lane_zero_runs_the_world_barrier() {
        const THREADS: usize = 4;
        let rendezvous = Rendezvous::new(THREADS);
        let calls = AtomicUsize::new(0);

        thread::scope(|s| {
            for lane in 0..THREADS {
                let rendezvous = &rendezvous;
                let calls = &calls;
                s.spawn(move || {
                    rendezvous
                        .collective(lane, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    assert_eq!(calls.load(Ordering::SeqCst), 1);
                });
            }
        });
    }

    #[test]
    fn failed_world_barrier_releases_siblings() {
        let rendezvous = Rendezvous::new(3);

        thread::scope(|s| {
            let siblings: Vec<_> = (1..3)
                .map(|lane| {
                    let rendezvous = &rendezvous;
                    s.spawn(move || rendezvous.collective(lane, || Ok(())))
                })
                .collect();

            let leader = rendezvous.collective(0, || Err(BenchError::PeerAborted));
            assert!(matches!(leader, Err(BenchError::PeerAborted)));

            for sibling in siblings {
                assert!(matches!(sibling.join().unwrap(), Err(BenchError::Aborted)));
            }
        });
    }

    #[test]
    fn root_cause_prefers_primary_errors() {
        let cause = root_cause(None, BenchError::Aborted);
        let cause = root_cause(cause, BenchError::NoAccessEpoch);
        let cause = root_cause(cause, BenchError::PeerAborted);
        assert!(matches!(cause, Some(BenchError::NoAccessEpoch)));
    }
}
