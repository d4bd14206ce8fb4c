use std::{io, ptr::NonNull, sync::Arc};

use rdma_sys::{ibv_access_flags, ibv_dereg_mr, ibv_mr, ibv_reg_mr};
use tracing::debug;

use super::{Device, RdmaError};

/// A registration of caller-owned memory. The memory must outlive it.
pub struct MemoryRegion {
    mr: NonNull<ibv_mr>,
    addr: u64,
    len: usize,
    _device: Arc<Device>,
}

// SAFETY: an ibv_mr is an immutable descriptor after registration; verbs
// calls on it are thread safe.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// # Safety
    ///
    /// `base..base + len` must stay allocated until the registration drops.
    pub unsafe fn register(
        device: &Arc<Device>,
        base: NonNull<u8>,
        len: usize,
        access: ibv_access_flags,
    ) -> Result<Self, RdmaError> {
        let mr = ibv_reg_mr(device.pd(), base.as_ptr().cast(), len, access.0 as i32);
        let mr = NonNull::new(mr).ok_or_else(|| RdmaError::RegMr {
            len,
            source: io::Error::last_os_error(),
        })?;

        debug!(addr = ?base, len, "registered memory region");

        Ok(Self {
            mr,
            addr: base.as_ptr() as u64,
            len,
            _device: device.clone(),
        })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lkey(&self) -> u32 {
        // SAFETY: valid until drop.
        unsafe { self.mr.as_ref().lkey }
    }

    pub fn rkey(&self) -> u32 {
        // SAFETY: valid until drop.
        unsafe { self.mr.as_ref().rkey }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            ibv_dereg_mr(self.mr.as_ptr());
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}
