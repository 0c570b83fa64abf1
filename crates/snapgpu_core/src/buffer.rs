use crate::ProtocolError;
use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use snapgpu_common::snap::BUFFER_ALIGN;

/// A fixed-length vector of 32-bit slots in host memory.
///
/// The allocation is aligned to `BUFFER_ALIGN` and zero-filled, matching
/// what `snap_malloc` followed by a volatile memset gives the action. The
/// memory is released exactly once, when the buffer is dropped.
pub struct SharedBuffer {
    ptr: NonNull<AtomicU32>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer owns its allocation and every access goes through
// atomics, so sharing it across threads cannot produce a data race.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Allocates `len` zeroed slots.
    ///
    /// # Returns
    ///
    /// `InvalidParameters` for a zero length or a byte length that overflows
    /// the layout, `OutOfMemory` if the allocator refuses the request.
    pub fn zeroed(len: usize) -> Result<Self, ProtocolError> {
        if len == 0 {
            return Err(ProtocolError::InvalidParameters);
        }
        let layout = Layout::array::<AtomicU32>(len)
            .and_then(|l| l.align_to(BUFFER_ALIGN))
            .map_err(|_| ProtocolError::InvalidParameters)?;

        // SAFETY: layout has a non-zero size because len > 0.
        let raw = unsafe { alloc_zeroed(layout) } as *mut AtomicU32;
        let ptr = NonNull::new(raw).ok_or(ProtocolError::OutOfMemory)?;
        Ok(Self { ptr, len, layout })
    }

    /// Number of 32-bit slots.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false for a buffer built by `zeroed`.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the vector in bytes, the length published to the action.
    pub fn byte_len(&self) -> usize {
        self.len * core::mem::size_of::<u32>()
    }

    /// Host address of the first slot, as published in the job descriptor.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// The slots, borrowed for as long as the buffer lives.
    #[inline(always)]
    pub fn slots(&self) -> &[AtomicU32] {
        // SAFETY: ptr covers len initialized (zeroed) AtomicU32 values for
        // as long as self is alive.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, self.layout) }
    }
}

/// Reconstructs a slot slice from an address the accelerator was given.
///
/// # Safety
///
/// * `addr` must be 4-byte aligned and point to `len` initialized words.
/// * The memory must stay allocated for `'a` and only be accessed
///   atomically during that time.
pub unsafe fn slots_at<'a>(addr: u64, len: usize) -> &'a [AtomicU32] {
    // SAFETY: guaranteed by the caller; AtomicU32 has the layout of u32.
    unsafe { core::slice::from_raw_parts(addr as *const AtomicU32, len) }
}

/// Copies the current contents of a slot slice.
pub fn snapshot(slots: &[AtomicU32]) -> alloc::vec::Vec<u32> {
    slots.iter().map(|s| s.load(Ordering::Relaxed)).collect()
}
