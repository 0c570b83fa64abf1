use core::sync::atomic::{AtomicU8, Ordering};

/// The two values an ownership flag takes.
///
/// `Ready` hands the guarded buffer to the accelerator. `Busy` means the
/// accelerator has let go of it and the host may act. Any byte other than
/// 1 reads as `Busy`, the same test the action applies.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    Busy = 0,
    Ready = 1,
}

impl FlagState {
    #[inline(always)]
    pub fn from_raw(raw: u8) -> Self {
        if raw == FlagState::Ready as u8 {
            FlagState::Ready
        } else {
            FlagState::Busy
        }
    }
}

/// Cache-line sized storage for one flag.
///
/// Only the first byte is the flag. The padding keeps the read and write
/// flags on separate lines and fills the 64-byte region the action is told
/// about in the job descriptor.
#[repr(C, align(64))]
pub struct OwnershipFlag {
    cell: AtomicU8,
    _pad: [u8; 63],
}

impl Default for OwnershipFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnershipFlag {
    /// A flag in the `Busy` state, as allocated.
    pub const fn new() -> Self {
        Self {
            cell: AtomicU8::new(FlagState::Busy as u8),
            _pad: [0; 63],
        }
    }

    /// Handle used to read and flip the flag.
    pub fn cell(&self) -> FlagCell<'_> {
        FlagCell(&self.cell)
    }

    /// Host address of the flag byte, as published to the accelerator.
    pub fn addr(&self) -> u64 {
        self.cell.as_ptr() as u64
    }
}

/// Borrowed handle to a flag byte, wherever it lives.
///
/// Loads use `Acquire` so that data the other side wrote before flipping
/// the flag is visible once the flip is observed. Stores use `Release` so
/// that data written before the flip reaches the other side first. The
/// atomic access also keeps the optimizer from hoisting the load out of a
/// spin loop.
#[derive(Clone, Copy)]
pub struct FlagCell<'a>(&'a AtomicU8);

impl<'a> FlagCell<'a> {
    /// Wraps a flag byte at a raw host address.
    ///
    /// # Safety
    ///
    /// * `addr` must point to a byte that stays allocated for `'a`.
    /// * Every other access to that byte during `'a` must be atomic.
    pub unsafe fn from_addr(addr: u64) -> Self {
        // SAFETY: guaranteed by the caller; AtomicU8 has no alignment
        // requirement beyond that of u8.
        Self(unsafe { AtomicU8::from_ptr(addr as *mut u8) })
    }

    /// Current state, re-read from memory on every call.
    #[inline(always)]
    pub fn state(&self) -> FlagState {
        FlagState::from_raw(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_ready(&self) -> bool {
        self.state() == FlagState::Ready
    }

    /// Sets the flag to `Ready`.
    #[inline(always)]
    pub fn raise(&self) {
        self.0.store(FlagState::Ready as u8, Ordering::Release);
    }

    /// Sets the flag to `Busy`.
    #[inline(always)]
    pub fn lower(&self) {
        self.0.store(FlagState::Busy as u8, Ordering::Release);
    }

    /// Stores an arbitrary byte, for peers that do not follow the protocol.
    #[inline(always)]
    pub fn store_raw(&self, raw: u8) {
        self.0.store(raw, Ordering::Release);
    }
}
