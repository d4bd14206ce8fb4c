//! Processes on one host sharing POSIX shared memory.
//!
//! Rank 0 creates the control segment `/<session>-ctl`, which holds the
//! world barrier; the other ranks open it. Each handle the sink creates is
//! backed by its own segment `/<session>-win<n>`, `n` counting the handles
//! created so far, which the source maps after the creation barrier.

use std::{
    io,
    mem::size_of,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use derivative::Derivative;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, info};

use crate::{
    barrier::SpinBarrier,
    config::RunConfig,
    error::{BenchError, Result},
    memory_region::{check_page_aligned, AlignedBuffer, LaneSlots, RegionMemory, RemoteView},
};

use super::{AccessEpoch, Fabric, Threading, TransferHandle};

const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ShmConfig {
    pub session: String,
    pub rank: usize,
    pub world_size: usize,
    pub connect_timeout: Duration,
}

#[repr(C)]
struct ControlBlock {
    barrier: SpinBarrier,
}

/// A mapped segment. The creating process owns it and unlinks it on drop.
struct Mapping(Shmem);

// SAFETY: the mapping is a fixed address range valid until drop; all access
// to its contents goes through atomics or lane-confined puts.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn base(&self) -> Result<NonNull<u8>> {
        let ptr = self.0.as_ptr();
        check_page_aligned(ptr)?;
        NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "segment mapped at null").into())
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

fn create_segment(os_id: &str, len: usize) -> Result<Mapping> {
    match ShmemConf::new().size(len).os_id(os_id).create() {
        Ok(shmem) => Ok(Mapping(shmem)),
        Err(ShmemError::MappingIdExists) => Err(BenchError::SessionInUse(os_id.to_owned())),
        Err(err) => Err(err.into()),
    }
}

/// Opens a segment another process creates, retrying until it exists with at
/// least `min_len` bytes.
fn open_segment(os_id: &str, min_len: usize, timeout: Duration) -> Result<Mapping> {
    let deadline = Instant::now() + timeout;
    loop {
        match ShmemConf::new().os_id(os_id).open() {
            Ok(shmem) if shmem.len() >= min_len => return Ok(Mapping(shmem)),
            Ok(_) | Err(_) if Instant::now() < deadline => thread::sleep(OPEN_RETRY_INTERVAL),
            Ok(shmem) => {
                return Err(BenchError::RegionTooSmall {
                    expected: min_len,
                    actual: shmem.len(),
                })
            }
            Err(_) => return Err(BenchError::ConnectTimeout(os_id.to_owned())),
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct ShmFabric {
    config: ShmConfig,
    #[derivative(Debug = "ignore")]
    control: Mapping,
    handles_created: AtomicUsize,
}

impl ShmFabric {
    /// Maps the session's control segment and waits for every rank.
    pub fn join(config: ShmConfig) -> Result<Self> {
        if config.rank >= config.world_size {
            return Err(BenchError::InvalidRank {
                rank: config.rank,
                size: config.world_size,
            });
        }

        let os_id = format!("/{}-ctl", config.session);
        let control = if config.rank == 0 {
            create_segment(&os_id, size_of::<ControlBlock>())?
        } else {
            open_segment(&os_id, size_of::<ControlBlock>(), config.connect_timeout)?
        };
        control.base()?;

        let fabric = Self {
            config,
            control,
            handles_created: AtomicUsize::new(0),
        };

        fabric.barrier()?;

        info!(
            session = %fabric.config.session,
            rank = fabric.config.rank,
            size = fabric.config.world_size,
            "joined shared memory session"
        );

        Ok(fabric)
    }

    fn control_block(&self) -> &ControlBlock {
        // SAFETY: the segment is page aligned, at least one control block
        // long and zero initialised on creation, which is a valid state.
        unsafe { &*(self.control.0.as_ptr() as *const ControlBlock) }
    }

    fn window_id(&self, epoch: usize) -> String {
        format!("/{}-win{}", self.config.session, epoch)
    }
}

impl Fabric for ShmFabric {
    type Region = ShmRegion;
    type Handle = ShmHandle;

    fn rank(&self) -> usize {
        self.config.rank
    }

    fn size(&self) -> usize {
        self.config.world_size
    }

    fn threading(&self) -> Threading {
        Threading::Multiple
    }

    fn barrier(&self) -> Result<()> {
        self.control_block()
            .barrier
            .wait(self.config.world_size)
            .map_err(|_| BenchError::PeerAborted)
    }

    fn abort(&self) {
        self.control_block().barrier.abort();
    }

    fn allocate_region(&self, len: usize) -> Result<ShmRegion> {
        let os_id = self.window_id(self.handles_created.load(Ordering::Relaxed));
        let mapping = create_segment(&os_id, len)?;
        let base = mapping.base()?;
        debug!(%os_id, len, "allocated shared region");
        Ok(ShmRegion { mapping, base, len })
    }

    fn create_handle(&self, region: Option<ShmRegion>, config: &RunConfig) -> Result<ShmHandle> {
        let epoch = self.handles_created.fetch_add(1, Ordering::Relaxed);

        self.barrier()?;

        let target = match region {
            Some(_) => None,
            None => {
                let os_id = self.window_id(epoch);
                let mapping = open_segment(&os_id, config.region_len(), self.config.connect_timeout)?;
                let base = mapping.base()?;
                // SAFETY: the view never outlives `mapping`, which the handle
                // keeps alongside it.
                let view = unsafe { RemoteView::new(base, mapping.len()) };
                debug!(%os_id, len = mapping.len(), "mapped peer region");
                Some((mapping, view))
            }
        };

        Ok(ShmHandle {
            target,
            region,
            slots: LaneSlots {
                lanes: config.num_threads(),
                width: config.message_size(),
            },
            epoch: AccessEpoch::default(),
        })
    }
}

/// A region in its own shared memory segment, owned by the sink.
pub struct ShmRegion {
    mapping: Mapping,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: see `Mapping`.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl RegionMemory for ShmRegion {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("os_id", &self.mapping.0.get_os_id())
            .field("len", &self.len)
            .finish()
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct ShmHandle {
    #[derivative(Debug = "ignore")]
    target: Option<(Mapping, RemoteView)>,
    region: Option<ShmRegion>,
    slots: LaneSlots,
    epoch: AccessEpoch,
}

impl TransferHandle for ShmHandle {
    type Region = ShmRegion;

    fn lock_all(&self) -> Result<()> {
        self.epoch.open()
    }

    fn unlock_all(&self) -> Result<()> {
        self.epoch.close()
    }

    fn put(&self, lane: usize, origin: &AlignedBuffer, target_disp: usize) -> Result<()> {
        self.epoch.ensure_open()?;
        let (_, view) = self.target.as_ref().ok_or(BenchError::NoRemoteRegion)?;
        self.slots.check(lane, target_disp, origin.len())?;

        // SAFETY: confined to the lane's slot, one thread per lane.
        unsafe { view.write(target_disp, origin.as_slice()) }
    }

    fn flush(&self, lane: usize) -> Result<()> {
        self.epoch.ensure_open()?;
        if lane >= self.slots.lanes {
            return Err(BenchError::InvalidLane {
                lane,
                lanes: self.slots.lanes,
            });
        }
        // Stores to coherent shared memory are complete on return; the fence
        // keeps them ahead of the next barrier.
        std::sync::atomic::fence(Ordering::Release);
        Ok(())
    }

    fn release(self) -> Result<Option<ShmRegion>> {
        drop(self.target);
        Ok(self.region)
    }
}
