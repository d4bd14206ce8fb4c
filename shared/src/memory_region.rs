use std::{
    alloc::{self, Layout},
    ops::Range,
    ptr::{self, NonNull},
    slice,
};

use nix::unistd::{sysconf, SysconfVar};

use crate::error::{BenchError, Result};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// The system page size, or 4096 if it cannot be queried.
pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Memory a transport can expose for remote writes.
pub trait RegionMemory: Send + Sync {
    fn base(&self) -> NonNull<u8>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Zero-initialised heap buffer aligned to the page size.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer uniquely owns its allocation.
unsafe impl Send for AlignedBuffer {}

// SAFETY: shared access only hands out the base pointer; writes through it
// are governed by the lane-slot rules of the transfer handle.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(len: usize) -> Result<Self> {
        let align = page_size();
        let layout = Layout::from_size_align(len.max(1), align)
            .map_err(|_| BenchError::Alloc { len, align })?;

        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };

        let ptr = NonNull::new(ptr).ok_or(BenchError::Alloc { len, align })?;

        Ok(Self { ptr, len, layout })
    }

    /// A buffer with every byte set to `byte`.
    pub fn filled(len: usize, byte: u8) -> Result<Self> {
        let mut buffer = Self::new(len)?;
        buffer.as_mut_slice().fill(byte);
        Ok(buffer)
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is initialised and at least `len` bytes long.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl RegionMemory for AlignedBuffer {
    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Returns an error unless `addr` is page aligned.
pub fn check_page_aligned(addr: *const u8) -> Result<()> {
    let align = page_size();
    if (addr as usize) % align != 0 {
        return Err(BenchError::Misaligned {
            addr: addr as usize,
            align,
        });
    }
    Ok(())
}

/// Static partition of a remote region into one slot per lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneSlots {
    pub lanes: usize,
    pub width: usize,
}

impl LaneSlots {
    pub fn slot(&self, lane: usize) -> Range<usize> {
        lane * self.width..(lane + 1) * self.width
    }

    /// Checks that a put of `len` bytes at `offset` stays inside the slot of
    /// `lane`.
    pub fn check(&self, lane: usize, offset: usize, len: usize) -> Result<()> {
        if lane >= self.lanes {
            return Err(BenchError::InvalidLane {
                lane,
                lanes: self.lanes,
            });
        }

        let slot = self.slot(lane);
        let end = offset.checked_add(len);
        match end {
            Some(end) if offset >= slot.start && end <= slot.end => Ok(()),
            _ => Err(BenchError::OutsideLaneSlot { lane, offset, len }),
        }
    }
}

/// Write-only view of a region mapped into this process, used by transports
/// whose puts are plain stores.
#[derive(Debug, Clone, Copy)]
pub struct RemoteView {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the view is only a pointer and a length; whoever creates it
// guarantees the mapping outlives every copy.
unsafe impl Send for RemoteView {}
unsafe impl Sync for RemoteView {}

impl RemoteView {
    /// # Safety
    /// `base..base + len` must stay mapped and writable for as long as the
    /// view or any copy of it is used.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `origin` to `offset`, bounds checked against the view.
    ///
    /// # Safety
    /// No other thread may access `offset..offset + origin.len()` of the
    /// region concurrently.
    pub unsafe fn write(&self, offset: usize, origin: &[u8]) -> Result<()> {
        match offset.checked_add(origin.len()) {
            Some(end) if end <= self.len => {
                ptr::copy_nonoverlapping(
                    origin.as_ptr(),
                    self.base.as_ptr().add(offset),
                    origin.len(),
                );
                Ok(())
            }
            _ => Err(BenchError::OutOfBounds {
                offset,
                len: origin.len(),
                region_len: self.len,
            }),
        }
    }
}
