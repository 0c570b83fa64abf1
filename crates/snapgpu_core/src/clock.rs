/// A monotonic nanosecond counter.
///
/// Only differences between readings are meaningful. Implementations must
/// be cheap enough to call from inside a spin loop.
pub trait Clock {
    fn now_ns(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// Clock advanced by hand, for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: core::cell::Cell<u64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ns: u64) {
        self.now.set(self.now.get() + ns);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.get()
    }
}
