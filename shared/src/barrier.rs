use std::sync::atomic::{AtomicBool, AtomicUsize};

use crossbeam::utils::{Backoff, CachePadded};

use crate::atomic_extension::{AtomicCounter, AtomicExtension};

/// Returned by [`SpinBarrier::wait`] once the barrier has been aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

/// Generation-counting barrier.
///
/// The all-zero bit pattern is a valid, fresh barrier, so one can live in a
/// newly created shared memory segment and be used by several processes.
/// Every party must pass the same `parties` count to every round.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SpinBarrier {
    arrived: CachePadded<AtomicUsize>,
    generation: CachePadded<AtomicUsize>,
    aborted: CachePadded<AtomicBool>,
}

impl SpinBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self, parties: usize) -> Result<(), Aborted> {
        if self.aborted.load_acquire() {
            return Err(Aborted);
        }

        let generation = self.generation.load_acquire();

        if self.arrived.increment_acq_rel() == parties {
            self.arrived.store_release(0);
            self.generation.store_release(generation.wrapping_add(1));
            return Ok(());
        }

        let backoff = Backoff::new();
        while self.generation.load_acquire() == generation {
            if self.aborted.load_acquire() {
                return Err(Aborted);
            }
            backoff.snooze();
        }

        Ok(())
    }

    /// Releases every current and future waiter with [`Aborted`].
    pub fn abort(&self) {
        self.aborted.store_release(true);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load_acquire()
    }
}
