use crate::exchange::ExchangeView;
use core::sync::atomic::Ordering;

/// The other party of the handshake.
///
/// The relay loop calls `poll` once per spin of its wait phase. A peer
/// that runs elsewhere (an FPGA action, another thread) ignores the call;
/// a peer simulated in the same thread uses it to take its turn.
pub trait Peer {
    fn poll(&mut self, exchange: &ExchangeView<'_>);
}

/// A peer that makes progress on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct Autonomous;

impl Peer for Autonomous {
    #[inline(always)]
    fn poll(&mut self, _exchange: &ExchangeView<'_>) {}
}

/// Reference accelerator: echoes the host vector back unchanged.
///
/// One round waits for both flags to be raised, copies every slot of the
/// host-to-accelerator vector into the accelerator-to-host vector, then
/// lowers the read flag and the write flag. It stops after `limit` rounds,
/// the job's iteration count.
#[derive(Debug, Clone)]
pub struct Loopback {
    rounds: u64,
    limit: u64,
}

impl Loopback {
    /// A loopback that stops after `limit` rounds.
    pub fn new(limit: u64) -> Self {
        Self { rounds: 0, limit }
    }

    /// Rounds performed so far.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn finished(&self) -> bool {
        self.rounds >= self.limit
    }

    /// Takes one turn if the host has handed the buffers over.
    ///
    /// Returns `true` if a round was performed.
    pub fn try_round(&mut self, exchange: &ExchangeView<'_>) -> bool {
        if self.finished() || !exchange.accelerator_may_act() {
            return false;
        }
        for (src, dst) in exchange.to_accel.iter().zip(exchange.to_host) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        exchange.read_flag.lower();
        exchange.write_flag.lower();
        self.rounds += 1;
        true
    }
}

impl Peer for Loopback {
    fn poll(&mut self, exchange: &ExchangeView<'_>) {
        self.try_round(exchange);
    }
}
