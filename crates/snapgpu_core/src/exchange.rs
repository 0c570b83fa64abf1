//! The memory the host and the accelerator trade every round.
//!
//! Two vectors and two flags. The host writes `to_accel` and reads
//! `to_host`; the accelerator does the opposite. Which side may touch a
//! vector at a given instant is decided only by the flags. Nothing in the
//! hardware enforces it.

use crate::ProtocolError;
use crate::buffer::{SharedBuffer, slots_at};
use crate::descriptor::JobDescriptor;
use crate::flag::{FlagCell, OwnershipFlag};
use alloc::boxed::Box;
use core::sync::atomic::AtomicU32;
use snapgpu_common::snap::FLAG_CELL_BYTES;

/// Host addresses of the four shared regions, in the form the job
/// descriptor publishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeAddrs {
    /// Host-to-accelerator vector. The action reads it.
    pub read: u64,
    /// Accelerator-to-host vector. The action writes it.
    pub write: u64,
    pub read_flag: u64,
    pub write_flag: u64,
}

/// Owner of the buffer pair and flag pair for one run.
///
/// Allocated once before the action is programmed and dropped after the
/// action is detached. Dropping it while an accelerator still holds the
/// published addresses is a use-after-free on the accelerator side, so the
/// host declares the exchange before the session that publishes it.
pub struct Exchange {
    to_accel: SharedBuffer,
    to_host: SharedBuffer,
    read_flag: Box<OwnershipFlag>,
    write_flag: Box<OwnershipFlag>,
}

impl Exchange {
    /// Allocates both vectors zero-filled and both flags `Busy`.
    pub fn allocate(vector_size: usize) -> Result<Self, ProtocolError> {
        Ok(Self {
            to_accel: SharedBuffer::zeroed(vector_size)?,
            to_host: SharedBuffer::zeroed(vector_size)?,
            read_flag: Box::new(OwnershipFlag::new()),
            write_flag: Box::new(OwnershipFlag::new()),
        })
    }

    /// Slots per vector.
    pub fn vector_size(&self) -> usize {
        self.to_accel.len()
    }

    /// Addresses to publish in the job descriptor.
    ///
    /// Stable for the lifetime of the exchange; the buffers and flags are
    /// never moved after allocation.
    pub fn addresses(&self) -> ExchangeAddrs {
        ExchangeAddrs {
            read: self.to_accel.addr(),
            write: self.to_host.addr(),
            read_flag: self.read_flag.addr(),
            write_flag: self.write_flag.addr(),
        }
    }

    /// Borrows all four regions for the relay loop or a simulated peer.
    pub fn view(&self) -> ExchangeView<'_> {
        ExchangeView {
            to_accel: self.to_accel.slots(),
            to_host: self.to_host.slots(),
            read_flag: self.read_flag.cell(),
            write_flag: self.write_flag.cell(),
        }
    }
}

/// Borrowed view of the exchange, usable from either side.
#[derive(Clone, Copy)]
pub struct ExchangeView<'a> {
    pub to_accel: &'a [AtomicU32],
    pub to_host: &'a [AtomicU32],
    /// Gates the host-to-accelerator vector.
    pub read_flag: FlagCell<'a>,
    /// Gates the accelerator-to-host vector.
    pub write_flag: FlagCell<'a>,
}

impl<'a> ExchangeView<'a> {
    /// Rebuilds the view an action sees from its programmed job.
    ///
    /// Checks that the descriptor is self-consistent before trusting any
    /// address in it.
    ///
    /// # Safety
    ///
    /// The four addresses in `job` must refer to live memory laid out as an
    /// [`Exchange`] of `job.vector_size` slots, and that memory must outlive
    /// `'a`.
    pub unsafe fn from_descriptor(job: &JobDescriptor) -> Result<Self, ProtocolError> {
        let len = usize::try_from(job.vector_size).map_err(|_| ProtocolError::Malformed)?;
        let byte_len = len
            .checked_mul(core::mem::size_of::<u32>())
            .ok_or(ProtocolError::Malformed)?;

        let vectors_ok = [job.read, job.write]
            .iter()
            .all(|d| d.addr != 0 && d.addr % 4 == 0 && d.size as usize == byte_len);
        let flags_ok = [job.read_flag, job.write_flag]
            .iter()
            .all(|d| d.addr != 0 && d.size >= 1 && d.size <= FLAG_CELL_BYTES);
        if len == 0 || !vectors_ok || !flags_ok {
            return Err(ProtocolError::Malformed);
        }

        // SAFETY: addresses validated for shape above; liveness is the
        // caller's contract.
        unsafe {
            Ok(Self {
                to_accel: slots_at(job.read.addr, len),
                to_host: slots_at(job.write.addr, len),
                read_flag: FlagCell::from_addr(job.read_flag.addr),
                write_flag: FlagCell::from_addr(job.write_flag.addr),
            })
        }
    }

    /// Slots per vector.
    pub fn vector_size(&self) -> usize {
        self.to_accel.len()
    }

    /// True once the accelerator has lowered both flags.
    ///
    /// The write flag is sampled first, then the read flag, the order the
    /// host has always polled them in.
    #[inline(always)]
    pub fn host_may_act(&self) -> bool {
        !self.write_flag.is_ready() && !self.read_flag.is_ready()
    }

    /// True once the host has raised both flags.
    #[inline(always)]
    pub fn accelerator_may_act(&self) -> bool {
        self.read_flag.is_ready() && self.write_flag.is_ready()
    }
}

/// Which party may currently mutate a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Host,
    Accelerator,
}

/// Host-side record of who owns each vector.
///
/// Transitions only happen through [`BufferOwnership::reclaim`] after the
/// flags were observed low and [`BufferOwnership::hand_off`] right before
/// they are raised. The record cannot stop a misbehaving accelerator, but it
/// keeps the host from writing outside its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOwnership {
    pub to_accel: Ownership,
    pub to_host: Ownership,
}

impl Default for BufferOwnership {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferOwnership {
    /// Both vectors start with the host: the action is idle until the
    /// flags are raised for the first time.
    pub const fn new() -> Self {
        Self {
            to_accel: Ownership::Host,
            to_host: Ownership::Host,
        }
    }

    /// True between a reclaim and the next hand-off.
    pub fn host_owns_both(&self) -> bool {
        self.to_accel == Ownership::Host && self.to_host == Ownership::Host
    }

    /// Gives both vectors to the accelerator. Called right before the
    /// flags are raised.
    pub fn hand_off(&mut self) {
        self.to_accel = Ownership::Accelerator;
        self.to_host = Ownership::Accelerator;
    }

    /// Takes both vectors back. Called once both flags were observed low.
    pub fn reclaim(&mut self) {
        self.to_accel = Ownership::Host;
        self.to_host = Ownership::Host;
    }
}
