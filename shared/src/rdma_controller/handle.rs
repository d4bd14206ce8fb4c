use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use rdma_sys::ibv_access_flags;

use crate::{
    config::RunConfig,
    error::{BenchError, Result},
    fabric::{AccessEpoch, TransferHandle},
    memory_region::{AlignedBuffer, LaneSlots, RegionMemory},
};

use super::{
    memory_region::MemoryRegion,
    qp_info::RegionInfo,
    queue_pair::{CompletionQueue, QueuePair},
    send::{LocalSlice, SendFlagBuilder},
    RdmaError,
};

const PUT_WR_ID: u64 = 0;
const FLUSH_WR_ID: u64 = 1;

/// Verbs state of one worker thread. Fields drop in order, so the queue
/// pair goes before its completion queue.
pub(super) struct Lane {
    pub(super) qp: QueuePair,
    pub(super) cq: CompletionQueue,
    pub(super) origin: Option<MemoryRegion>,
}

pub struct VerbsHandle {
    lanes: Box<[CachePadded<Mutex<Lane>>]>,
    target: Option<RegionInfo>,
    region_mr: Option<MemoryRegion>,
    region: Option<AlignedBuffer>,
    slots: LaneSlots,
    epoch: AccessEpoch,
}

impl VerbsHandle {
    pub(super) fn new(
        lanes: Vec<Lane>,
        target: Option<RegionInfo>,
        region_mr: Option<MemoryRegion>,
        region: Option<AlignedBuffer>,
        config: &RunConfig,
    ) -> Self {
        Self {
            lanes: lanes
                .into_iter()
                .map(|lane| CachePadded::new(Mutex::new(lane)))
                .collect(),
            target,
            region_mr,
            region,
            slots: LaneSlots {
                lanes: config.num_threads(),
                width: config.message_size(),
            },
            epoch: AccessEpoch::default(),
        }
    }

    fn lane(&self, lane: usize) -> Result<MutexGuard<'_, Lane>> {
        let slot = self.lanes.get(lane).ok_or(BenchError::InvalidLane {
            lane,
            lanes: self.lanes.len(),
        })?;
        Ok(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for VerbsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerbsHandle")
            .field("lanes", &self.lanes.len())
            .field("target", &self.target)
            .field("region_mr", &self.region_mr)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl TransferHandle for VerbsHandle {
    type Region = AlignedBuffer;

    fn lock_all(&self) -> Result<()> {
        self.epoch.open()
    }

    fn unlock_all(&self) -> Result<()> {
        self.epoch.close()
    }

    fn attach_origin(&self, lane: usize, origin: &AlignedBuffer) -> Result<()> {
        let mut state = self.lane(lane)?;
        // SAFETY: the engine keeps the scratch buffer alive until after
        // `detach_origin`.
        let mr = unsafe {
            MemoryRegion::register(
                state.qp.device(),
                origin.base(),
                origin.len(),
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE,
            )?
        };
        state.origin = Some(mr);
        Ok(())
    }

    fn detach_origin(&self, lane: usize) -> Result<()> {
        self.lane(lane)?.origin = None;
        Ok(())
    }

    fn put(&self, lane: usize, origin: &AlignedBuffer, target_disp: usize) -> Result<()> {
        self.epoch.ensure_open()?;
        let target = self.target.as_ref().ok_or(BenchError::NoRemoteRegion)?;
        self.slots.check(lane, target_disp, origin.len())?;
        if (target_disp + origin.len()) as u64 > target.len {
            return Err(BenchError::OutOfBounds {
                offset: target_disp,
                len: origin.len(),
                region_len: target.len as usize,
            });
        }

        let state = self.lane(lane)?;
        let mr = state
            .origin
            .as_ref()
            .filter(|mr| mr.addr() == origin.base().as_ptr() as u64 && mr.len() >= origin.len())
            .ok_or(RdmaError::OriginNotAttached(lane))?;
        let len = u32::try_from(origin.len()).map_err(|_| RdmaError::MessageTooLarge(origin.len()))?;

        // SAFETY: the origin is registered for this lane and the target range
        // was bounds checked against the peer's registration.
        unsafe {
            state.qp.post_write(
                PUT_WR_ID,
                Some(LocalSlice {
                    addr: mr.addr(),
                    len,
                    lkey: mr.lkey(),
                }),
                target.addr + target_disp as u64,
                target.rkey,
                0,
            )
        }
        .map_err(|source| RdmaError::PostSend { lane, source })?;

        Ok(())
    }

    /// Posts a signaled zero-length write and waits for it. Completions on a
    /// reliable connection arrive in order, so every earlier put of the lane
    /// is done once it shows up.
    fn flush(&self, lane: usize) -> Result<()> {
        self.epoch.ensure_open()?;
        let state = self.lane(lane)?;
        let Some(target) = self.target.as_ref() else {
            return Ok(());
        };

        // SAFETY: a zero-length write touches no memory.
        unsafe {
            state.qp.post_write(
                FLUSH_WR_ID,
                None,
                target.addr + self.slots.slot(lane).start as u64,
                target.rkey,
                SendFlagBuilder::new().signaled().build(),
            )
        }
        .map_err(|source| RdmaError::PostSend { lane, source })?;

        loop {
            for wc in state.cq.poll()? {
                if !wc.is_success() {
                    return Err(RdmaError::Completion {
                        lane,
                        wr_id: wc.wr_id(),
                        status: wc.status(),
                    }
                    .into());
                }
                if wc.wr_id() == FLUSH_WR_ID {
                    return Ok(());
                }
            }
            std::hint::spin_loop();
        }
    }

    fn release(self) -> Result<Option<AlignedBuffer>> {
        let Self {
            lanes,
            region_mr,
            region,
            ..
        } = self;
        // Queue pairs and registrations go before the memory they cover.
        drop(lanes);
        drop(region_mr);
        Ok(region)
    }
}
