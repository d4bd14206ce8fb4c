//! The one-sided communication layer the benchmark drives.
//!
//! A [`Fabric`] is one process's view of the communicator: its rank, the
//! world size, a process-wide barrier and the collective creation of
//! [`TransferHandle`]s. A handle binds the sink's exposed region and lets
//! the source put into it from many threads, each on its own lane.

use std::sync::atomic::AtomicBool;

use crate::{
    atomic_extension::AtomicExtension,
    config::RunConfig,
    error::{BenchError, Result},
    memory_region::{AlignedBuffer, RegionMemory},
};

pub mod loopback;
pub mod shm;

/// How much concurrency a transport allows in its calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Threading {
    /// Only one thread exists.
    Single,
    /// Only the main thread makes calls.
    Funneled,
    /// Any thread, one at a time.
    Serialized,
    /// Any thread, concurrently.
    Multiple,
}

pub trait Fabric: Sync {
    type Region: RegionMemory;
    type Handle: TransferHandle<Region = Self::Region>;

    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn threading(&self) -> Threading;

    /// Blocks until every process of the world has called it.
    fn barrier(&self) -> Result<()>;

    /// Fails the run everywhere. Processes blocked in a collective return
    /// [`BenchError::PeerAborted`].
    fn abort(&self);

    /// Page-aligned memory this transport can expose.
    fn allocate_region(&self, len: usize) -> Result<Self::Region>;

    /// Collective. The sink passes the region it exposes, the source passes
    /// `None` and gets a handle targeting its peer's region.
    fn create_handle(
        &self,
        region: Option<Self::Region>,
        config: &RunConfig,
    ) -> Result<Self::Handle>;
}

/// A registered window onto the peer's region.
///
/// Lane `i` belongs to worker thread `i`; a lane must never be driven by two
/// threads at once. Puts of lane `i` may only touch slot `i` of the region.
pub trait TransferHandle: Sync {
    type Region;

    /// Opens a shared access epoch on the whole target region, granted once
    /// instead of per operation.
    fn lock_all(&self) -> Result<()>;

    fn unlock_all(&self) -> Result<()>;

    /// Makes `origin` usable as a put source on `lane`.
    fn attach_origin(&self, _lane: usize, _origin: &AlignedBuffer) -> Result<()> {
        Ok(())
    }

    fn detach_origin(&self, _lane: usize) -> Result<()> {
        Ok(())
    }

    /// Starts a write of all of `origin` to `target_disp` in the peer's
    /// region. Completion is only guaranteed by a later [`flush`].
    ///
    /// [`flush`]: TransferHandle::flush
    fn put(&self, lane: usize, origin: &AlignedBuffer, target_disp: usize) -> Result<()>;

    /// Blocks until every put issued on `lane` is delivered and visible at
    /// the target.
    fn flush(&self, lane: usize) -> Result<()>;

    /// Tears the handle down. The sink gets its region back.
    fn release(self) -> Result<Option<Self::Region>>;
}

/// Tracks whether a handle's shared access epoch is open.
#[derive(Debug, Default)]
pub struct AccessEpoch {
    open: AtomicBool,
}

impl AccessEpoch {
    pub fn open(&self) -> Result<()> {
        if self.open.swap_acq_rel(true) {
            return Err(BenchError::AccessEpochOpen);
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if !self.open.swap_acq_rel(false) {
            return Err(BenchError::NoAccessEpoch);
        }
        Ok(())
    }

    pub fn ensure_open(&self) -> Result<()> {
        if !self.open.load_relaxed() {
            return Err(BenchError::NoAccessEpoch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_epoch_must_be_opened_once() {
        let epoch = AccessEpoch::default();
        assert!(matches!(epoch.ensure_open(), Err(BenchError::NoAccessEpoch)));
        assert!(matches!(epoch.close(), Err(BenchError::NoAccessEpoch)));

        epoch.open().unwrap();
        epoch.ensure_open().unwrap();
        assert!(matches!(epoch.open(), Err(BenchError::AccessEpochOpen)));

        epoch.close().unwrap();
        assert!(matches!(epoch.ensure_open(), Err(BenchError::NoAccessEpoch)));
    }

    #[test]
    fn multiple_is_the_strongest_level() {
        assert!(Threading::Multiple > Threading::Serialized);
        assert!(Threading::Funneled > Threading::Single);
    }
}
