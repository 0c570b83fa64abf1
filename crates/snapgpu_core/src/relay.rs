//! The host half of the relay protocol.
//!
//! Per round the host spins until the accelerator has lowered both flags,
//! writes the elementwise self-sum of the vector it received into the
//! vector it sends, and raises the read flag then the write flag. The loop
//! runs a fixed number of rounds. There is no cancellation; the only way
//! out of a wait phase other than the accelerator answering is the
//! optional hang bound.

use crate::ProtocolError;
use crate::clock::Clock;
use crate::exchange::{BufferOwnership, ExchangeView};
use crate::peer::Peer;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Spins between two clock readings in the wait phase.
///
/// Reading the clock costs far more than reading a flag, so the hang bound
/// is only checked every this many spins.
pub const CLOCK_CHECK_INTERVAL: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayParams {
    pub max_iteration: u64,
    /// Upper bound on a single wait phase. `None` spins forever.
    pub hang_timeout_ns: Option<u64>,
}

/// Loop start and end, taken right after the first hand-off and right
/// after the last release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTimings {
    pub loop_start_ns: u64,
    pub loop_end_ns: u64,
    pub rounds: u64,
}

impl RelayTimings {
    /// Loop duration, zero if the clock went backwards.
    pub fn elapsed_ns(&self) -> u64 {
        self.loop_end_ns.saturating_sub(self.loop_start_ns)
    }
}

/// First three and last slot of a vector, for the per-round echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preview {
    head: [u32; 3],
    shown: usize,
    last: u32,
}

impl Preview {
    /// Samples a vector. Vectors shorter than three slots show what they
    /// have.
    pub fn of(slots: &[AtomicU32]) -> Self {
        let mut head = [0u32; 3];
        let shown = slots.len().min(head.len());
        for (dst, src) in head.iter_mut().zip(slots) {
            *dst = src.load(Ordering::Relaxed);
        }
        let last = slots.last().map_or(0, |s| s.load(Ordering::Relaxed));
        Self { head, shown, last }
    }

    /// Up to the first three values.
    pub fn head(&self) -> &[u32] {
        &self.head[..self.shown]
    }

    /// Value of the final slot.
    pub fn last(&self) -> u32 {
        self.last
    }
}

impl fmt::Display for Preview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.head().iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ", ... , {}]", self.last)
    }
}

/// What the host saw and wrote in one round.
#[derive(Debug, Clone, Copy)]
pub struct RoundEcho {
    /// 1-based round number.
    pub iteration: u64,
    pub max_iteration: u64,
    pub received: Preview,
    pub written: Preview,
    /// From the start of the wait phase to the end of the transform.
    pub round_ns: u64,
}

/// Drives the handshake over one exchange.
pub struct RelayLoop<'a> {
    view: ExchangeView<'a>,
    params: RelayParams,
    ownership: BufferOwnership,
    completed: u64,
}

impl<'a> RelayLoop<'a> {
    /// Prepares a loop over `view` with both vectors owned by the host.
    ///
    /// # Returns
    ///
    /// `InvalidParameters` for zero rounds or an empty exchange,
    /// `LengthMismatch` if the two vectors differ in length.
    pub fn new(view: ExchangeView<'a>, params: RelayParams) -> Result<Self, ProtocolError> {
        if params.max_iteration == 0 || view.vector_size() == 0 {
            return Err(ProtocolError::InvalidParameters);
        }
        if view.to_host.len() != view.to_accel.len() {
            return Err(ProtocolError::LengthMismatch {
                expected: view.to_accel.len(),
                actual: view.to_host.len(),
            });
        }
        Ok(Self {
            view,
            params,
            ownership: BufferOwnership::new(),
            completed: 0,
        })
    }

    /// Who holds each vector right now.
    pub fn ownership(&self) -> BufferOwnership {
        self.ownership
    }

    /// Rounds finished so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Writes the initial vector `0, 1, 2, ...` into the outgoing buffer.
    ///
    /// Only allowed before the first hand-off.
    pub fn seed(&mut self) -> Result<Preview, ProtocolError> {
        if !self.ownership.host_owns_both() {
            return Err(ProtocolError::NotOwned);
        }
        for (k, slot) in self.view.to_accel.iter().enumerate() {
            slot.store(k as u32, Ordering::Relaxed);
        }
        Ok(Preview::of(self.view.to_accel))
    }

    /// Hands both buffers to the accelerator and runs every round.
    ///
    /// `on_round` is called after each transform, while the host still
    /// owns both buffers.
    pub fn run<P, C, F>(
        &mut self,
        peer: &mut P,
        clock: &C,
        mut on_round: F,
    ) -> Result<RelayTimings, ProtocolError>
    where
        P: Peer + ?Sized,
        C: Clock + ?Sized,
        F: FnMut(&RoundEcho),
    {
        if !self.ownership.host_owns_both() {
            return Err(ProtocolError::NotOwned);
        }
        self.release();
        let loop_start_ns = clock.now_ns();

        while self.completed < self.params.max_iteration {
            let round_start = clock.now_ns();
            let mut window = self.wait(peer, clock)?;
            let (received, written) = window.relay_doubled();
            let echo = RoundEcho {
                iteration: window.iteration(),
                max_iteration: window.relay.params.max_iteration,
                received,
                written,
                round_ns: clock.now_ns().saturating_sub(round_start),
            };
            on_round(&echo);
            window.release();
        }

        Ok(RelayTimings {
            loop_start_ns,
            loop_end_ns: clock.now_ns(),
            rounds: self.completed,
        })
    }

    /// Spins until both flags are low, then returns the host's window.
    fn wait<P, C>(&mut self, peer: &mut P, clock: &C) -> Result<HostWindow<'_, 'a>, ProtocolError>
    where
        P: Peer + ?Sized,
        C: Clock + ?Sized,
    {
        let wait_start = clock.now_ns();
        let mut spins: u32 = 0;

        while !self.view.host_may_act() {
            peer.poll(&self.view);
            core::hint::spin_loop();

            spins = spins.wrapping_add(1);
            if spins % CLOCK_CHECK_INTERVAL == 0 {
                if let Some(limit) = self.params.hang_timeout_ns {
                    let waited_ns = clock.now_ns().saturating_sub(wait_start);
                    if waited_ns > limit {
                        return Err(ProtocolError::Hang {
                            iteration: self.completed + 1,
                            waited_ns,
                        });
                    }
                }
            }
        }

        self.ownership.reclaim();
        Ok(HostWindow { relay: self })
    }

    fn release(&mut self) {
        self.ownership.hand_off();
        self.view.read_flag.raise();
        self.view.write_flag.raise();
    }
}

/// Proof that the host currently owns both vectors.
///
/// Only a completed wait phase produces one, and giving it up raises the
/// flags, so the transform cannot run outside the host's turn.
pub struct HostWindow<'r, 'a> {
    relay: &'r mut RelayLoop<'a>,
}

impl HostWindow<'_, '_> {
    fn iteration(&self) -> u64 {
        self.relay.completed + 1
    }

    /// `to_accel[k] = to_host[k] + to_host[k]`, wrapping.
    ///
    /// Returns previews of the received and the written vector.
    fn relay_doubled(&mut self) -> (Preview, Preview) {
        let view = &self.relay.view;
        for (src, dst) in view.to_host.iter().zip(view.to_accel) {
            let v = src.load(Ordering::Relaxed);
            dst.store(v.wrapping_add(v), Ordering::Relaxed);
        }
        (Preview::of(view.to_host), Preview::of(view.to_accel))
    }

    fn release(self) {
        self.relay.completed += 1;
        self.relay.release();
    }
}
