//! Host side of the SNAP/GPU latency relay.
//!
//! This crate owns the memory shared with the accelerator and the
//! busy-poll handshake that trades it back and forth. It has no knowledge
//! of how the accelerator is attached; the host binary supplies that,
//! together with a clock. Nothing here blocks in the OS, allocates after
//! setup, or logs, so the relay loop can run on an isolated core.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::fmt;

/// Word arrays the accelerator reads and writes directly.
///
/// Each buffer is a cache-line aligned, zero-initialized allocation of
/// 32-bit slots. Slots are atomics so both parties may touch the memory
/// without undefined behaviour, even though the handshake guarantees they
/// never do so at the same time.
pub mod buffer;

/// Abstract monotonic time source.
///
/// The relay loop timestamps phases and bounds the wait phase through this
/// trait, which lets tests drive it with a manual clock.
pub mod clock;

/// Job descriptor builder and wire encoding.
///
/// Produces the fixed-size parameter block that the SNAP library copies
/// into the action's register window before starting it.
pub mod descriptor;

/// The buffer pair, the flag pair, and per-buffer ownership tracking.
pub mod exchange;

/// Single-byte ownership flags.
pub mod flag;

/// The accelerator as seen from the relay loop.
///
/// Real hardware advances on its own; simulated accelerators are stepped
/// from inside the wait phase so tests stay deterministic.
pub mod peer;

/// The synchronization loop: wait, transform, release.
pub mod relay;

/// Failure modes of the shared-memory relay.
///
/// None of these allocate, so they can be returned from the hot loop
/// without disturbing the timing being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A run parameter is outside its valid range.
    ///
    /// Raised for a zero vector size, a zero iteration count, or a vector
    /// whose byte length does not fit the 32-bit size field of an address
    /// descriptor.
    InvalidParameters,

    /// A buffer does not have the length the run was configured for.
    LengthMismatch { expected: usize, actual: usize },

    /// The accelerator did not hand the buffers back within the bound.
    ///
    /// `iteration` is the 1-based round whose wait phase expired.
    Hang { iteration: u64, waited_ns: u64 },

    /// An encoded job does not fit into the destination window.
    DescriptorTooLarge { len: usize, capacity: usize },

    /// The shared buffer allocation failed.
    OutOfMemory,

    /// A job descriptor read back from bytes is inconsistent.
    Malformed,

    /// The host touched a buffer it does not currently own.
    NotOwned,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameters => write!(f, "invalid relay parameters"),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "buffer holds {actual} slots, expected {expected}")
            }
            Self::Hang {
                iteration,
                waited_ns,
            } => write!(
                f,
                "accelerator did not release the buffers in iteration {iteration} after {} us",
                waited_ns / 1000
            ),
            Self::DescriptorTooLarge { len, capacity } => {
                write!(f, "job of {len} bytes exceeds the {capacity} byte window")
            }
            Self::OutOfMemory => write!(f, "shared buffer allocation failed"),
            Self::Malformed => write!(f, "malformed job descriptor"),
            Self::NotOwned => write!(f, "buffer is owned by the accelerator"),
        }
    }
}
