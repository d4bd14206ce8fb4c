//! Every rank inside one OS process. Puts are plain copies into the sink's
//! heap region.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};

use tracing::debug;

use crate::{
    barrier::SpinBarrier,
    config::RunConfig,
    error::{BenchError, Result},
    memory_region::{AlignedBuffer, LaneSlots, RegionMemory, RemoteView},
    role::peer_rank,
};

use super::{AccessEpoch, Fabric, Threading, TransferHandle};

#[derive(Debug)]
struct World {
    size: usize,
    threading: Threading,
    barrier: SpinBarrier,
    /// Region each rank currently exposes.
    exposed: Mutex<Vec<Option<Arc<AlignedBuffer>>>>,
}

impl World {
    fn exposure(&self, rank: usize) -> Option<Arc<AlignedBuffer>> {
        self.exposed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rank)
            .cloned()
            .flatten()
    }

    fn set_exposure(&self, rank: usize, region: Option<Arc<AlignedBuffer>>) {
        let mut exposed = self.exposed.lock().unwrap_or_else(PoisonError::into_inner);
        exposed[rank] = region;
    }
}

/// A peer's region as seen by the handle that writes to it.
#[derive(Debug)]
struct Target {
    view: RemoteView,
    _region: Arc<AlignedBuffer>,
}

impl Target {
    fn new(region: Arc<AlignedBuffer>) -> Self {
        // SAFETY: the view never outlives `_region`, which keeps the heap
        // block allocated.
        let view = unsafe { RemoteView::new(region.base(), region.len()) };
        Self {
            view,
            _region: region,
        }
    }
}

/// One rank of an in-process world.
#[derive(Debug)]
pub struct LoopbackFabric {
    rank: usize,
    world: Arc<World>,
    handles_created: AtomicUsize,
}

impl LoopbackFabric {
    /// A source (rank 0) and a sink (rank 1).
    pub fn pair() -> (Self, Self) {
        let mut world = Self::world(2);
        let sink = world.pop();
        let source = world.pop();
        match (source, sink) {
            (Some(source), Some(sink)) => (source, sink),
            _ => unreachable!("a world of two has two ranks"),
        }
    }

    pub fn world(size: usize) -> Vec<Self> {
        Self::world_with_threading(size, Threading::Multiple)
    }

    /// A world whose ranks report `threading` as their support level.
    pub fn world_with_threading(size: usize, threading: Threading) -> Vec<Self> {
        let world = Arc::new(World {
            size,
            threading,
            barrier: SpinBarrier::new(),
            exposed: Mutex::new(vec![None; size]),
        });

        (0..size)
            .map(|rank| Self {
                rank,
                world: world.clone(),
                handles_created: AtomicUsize::new(0),
            })
            .collect()
    }

    /// Number of ranks whose region is currently exposed.
    pub fn exposed_regions(&self) -> usize {
        self.world
            .exposed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|view| view.is_some())
            .count()
    }

    pub fn handles_created(&self) -> usize {
        self.handles_created.load(Ordering::Relaxed)
    }
}

impl Fabric for LoopbackFabric {
    type Region = AlignedBuffer;
    type Handle = LoopbackHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world.size
    }

    fn threading(&self) -> Threading {
        self.world.threading
    }

    fn barrier(&self) -> Result<()> {
        self.world
            .barrier
            .wait(self.world.size)
            .map_err(|_| BenchError::PeerAborted)
    }

    fn abort(&self) {
        self.world.barrier.abort();
    }

    fn allocate_region(&self, len: usize) -> Result<AlignedBuffer> {
        AlignedBuffer::new(len)
    }

    fn create_handle(
        &self,
        region: Option<AlignedBuffer>,
        config: &RunConfig,
    ) -> Result<LoopbackHandle> {
        let region = region.map(Arc::new);
        if let Some(region) = &region {
            self.world.set_exposure(self.rank, Some(region.clone()));
        }

        // Dropping the handle on any early return withdraws the exposure.
        let mut handle = LoopbackHandle {
            rank: self.rank,
            world: self.world.clone(),
            target: None,
            region,
            origins: AtomicUsize::new(0),
            slots: LaneSlots {
                lanes: config.num_threads(),
                width: config.message_size(),
            },
            epoch: AccessEpoch::default(),
        };

        self.barrier()?;

        if handle.region.is_none() {
            let peer = peer_rank(self.rank);
            let region = self.world.exposure(peer).ok_or(BenchError::NoRemoteRegion)?;
            if region.len() < config.region_len() {
                return Err(BenchError::RegionTooSmall {
                    expected: config.region_len(),
                    actual: region.len(),
                });
            }
            debug!(rank = self.rank, peer, len = region.len(), "targeting peer region");
            handle.target = Some(Target::new(region));
        }

        self.handles_created.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }
}

/// Source handles hold a reference to the sink's region, so the sink only
/// gets its region back once every source handle targeting it is gone.
#[derive(Debug)]
pub struct LoopbackHandle {
    rank: usize,
    world: Arc<World>,
    target: Option<Target>,
    region: Option<Arc<AlignedBuffer>>,
    origins: AtomicUsize,
    slots: LaneSlots,
    epoch: AccessEpoch,
}

impl LoopbackHandle {
    /// Number of lanes with an origin buffer attached.
    pub fn attached_origins(&self) -> usize {
        self.origins.load(Ordering::Acquire)
    }

    fn check_lane(&self, lane: usize) -> Result<()> {
        if lane >= self.slots.lanes {
            return Err(BenchError::InvalidLane {
                lane,
                lanes: self.slots.lanes,
            });
        }
        Ok(())
    }

    fn withdraw(&self) {
        if self.region.is_some() {
            self.world.set_exposure(self.rank, None);
        }
    }
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        self.withdraw();
    }
}

impl TransferHandle for LoopbackHandle {
    type Region = AlignedBuffer;

    fn lock_all(&self) -> Result<()> {
        self.epoch.open()
    }

    fn unlock_all(&self) -> Result<()> {
        self.epoch.close()
    }

    fn attach_origin(&self, lane: usize, _origin: &AlignedBuffer) -> Result<()> {
        self.check_lane(lane)?;
        self.origins.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn detach_origin(&self, lane: usize) -> Result<()> {
        self.check_lane(lane)?;
        self.origins.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn put(&self, lane: usize, origin: &AlignedBuffer, target_disp: usize) -> Result<()> {
        self.epoch.ensure_open()?;
        let target = self.target.as_ref().ok_or(BenchError::NoRemoteRegion)?;
        self.slots.check(lane, target_disp, origin.len())?;

        // SAFETY: the slot check confines this lane to its own slot, and a
        // lane is driven by one thread at a time.
        unsafe { target.view.write(target_disp, origin.as_slice()) }
    }

    fn flush(&self, lane: usize) -> Result<()> {
        self.epoch.ensure_open()?;
        self.check_lane(lane)?;
        // Copies complete on return; the fence orders them before whatever
        // synchronisation publishes them to the sink.
        std::sync::atomic::fence(Ordering::Release);
        Ok(())
    }

    fn release(mut self) -> Result<Option<AlignedBuffer>> {
        self.withdraw();
        self.target = None;

        let Some(region) = self.region.take() else {
            return Ok(None);
        };
        Arc::try_unwrap(region)
            .map(Some)
            .map_err(|region| BenchError::RegionInUse(Arc::strong_count(&region) - 1))
    }
}
