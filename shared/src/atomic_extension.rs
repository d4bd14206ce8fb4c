use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Shorthands for the orderings the synchronisation code uses.
pub trait AtomicExtension {
    type T;
    fn load_acquire(&self) -> Self::T;
    fn store_release(&self, val: Self::T);
    fn load_relaxed(&self) -> Self::T;
    fn swap_acq_rel(&self, val: Self::T) -> Self::T;
}

macro_rules! impl_atomic_extension {
    ($t:ty, $atomic_type:ty) => {
        impl AtomicExtension for $atomic_type {
            type T = $t;
            fn load_acquire(&self) -> $t {
                self.load(Ordering::Acquire)
            }
            fn store_release(&self, val: $t) {
                self.store(val, Ordering::Release);
            }
            fn load_relaxed(&self) -> $t {
                self.load(Ordering::Relaxed)
            }
            fn swap_acq_rel(&self, val: $t) -> $t {
                self.swap(val, Ordering::AcqRel)
            }
        }
    };
}

impl_atomic_extension!(usize, AtomicUsize);
impl_atomic_extension!(bool, AtomicBool);

/// Counter operations used by barriers and tallies.
pub trait AtomicCounter {
    /// Adds one and returns the value after the increment.
    fn increment_acq_rel(&self) -> usize;
}

impl AtomicCounter for AtomicUsize {
    fn increment_acq_rel(&self) -> usize {
        self.fetch_add(1, Ordering::AcqRel) + 1
    }
}
