//! Latency statistics for the relay.
//!
//! Two views of the same run: the coarse timestamps the final report is
//! built from, and a per-round histogram for spotting outliers.

use std::io::{self, Write};

/// Number of histogram buckets. The last one also collects everything
/// above its lower bound.
const BUCKETS: usize = 20;

/// Bucket width in nanoseconds (10 us).
const BUCKET_NS: u64 = 10_000;

/// Per-round latency tracker.
///
/// Keeps min, max, and sum alongside a fixed histogram so updates stay a
/// handful of integer operations inside the relay loop.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    /// Shortest round seen, `u64::MAX` until the first update.
    pub min: u64,
    pub max: u64,
    /// Sum of all rounds, saturating.
    pub sum: u64,
    pub count: u64,
    /// Round counts per 10 us bucket.
    pub buckets: [u64; BUCKETS],
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    /// Creates an empty tracker.
    ///
    /// `min` starts at `u64::MAX` so the first round recorded becomes the
    /// minimum.
    pub fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            buckets: [0; BUCKETS],
        }
    }

    /// Records one round.
    ///
    /// # Arguments
    ///
    /// * `nanos` - Wall time of the round in nanoseconds. Rounds of 190 us
    ///   and more all land in the last bucket.
    pub fn update(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum = self.sum.saturating_add(nanos);
        self.count += 1;

        let idx = (nanos / BUCKET_NS).min(BUCKETS as u64 - 1) as usize;
        self.buckets[idx] += 1;
    }

    /// Average round time.
    ///
    /// # Returns
    ///
    /// The mean in nanoseconds, or 0.0 before the first update.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Writes min/avg/max and the non-empty buckets.
    ///
    /// Values below one microsecond on average are shown in ns, otherwise
    /// in us.
    pub fn write_report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "Per-round latency")?;
        writeln!(out, "Count: {}", self.count)?;
        if self.count == 0 {
            return Ok(());
        }

        let avg_ns = self.avg();
        if avg_ns < 1000.0 {
            writeln!(out, "Min:   {:.2} ns", self.min as f64)?;
            writeln!(out, "Avg:   {:.2} ns", avg_ns)?;
            writeln!(out, "Max:   {:.2} ns", self.max as f64)?;
        } else {
            writeln!(out, "Min:   {:.2} us", self.min as f64 / 1000.0)?;
            writeln!(out, "Avg:   {:.2} us", avg_ns / 1000.0)?;
            writeln!(out, "Max:   {:.2} us", self.max as f64 / 1000.0)?;
        }

        writeln!(out, "Distribution (10us buckets):")?;
        for (i, &count) in self.buckets.iter().enumerate() {
            if count > 0 {
                let open = if i == BUCKETS - 1 { ">" } else { "" };
                let (lower, upper) = (i * 10, (i + 1) * 10);
                writeln!(out, "[{lower:3}-{upper:3}{open} us]: {count}")?;
            }
        }
        Ok(())
    }
}

/// Timestamps of one run, all in nanoseconds on the same clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatistics {
    /// Just before the job registers are written.
    pub program_ns: u64,
    /// Right after the action was started.
    pub launch_ns: u64,
    /// Right after the first hand-off to the accelerator.
    pub loop_start_ns: u64,
    /// Right after the last release.
    pub loop_end_ns: u64,
    /// Configured round count, the divisor of the average.
    pub max_iteration: u64,
}

impl RunStatistics {
    /// Register write plus action start, in whole microseconds.
    pub fn setup_us(&self) -> u64 {
        self.launch_ns.saturating_sub(self.program_ns) / 1000
    }

    /// Mean wall time of one round in microseconds.
    ///
    /// # Returns
    ///
    /// `None` when no round was configured, instead of dividing by zero.
    pub fn avg_iteration_us(&self) -> Option<f64> {
        if self.max_iteration == 0 {
            return None;
        }
        let loop_ns = self.loop_end_ns.saturating_sub(self.loop_start_ns);
        Some(loop_ns as f64 / 1000.0 / self.max_iteration as f64)
    }

    /// The two closing lines of the report.
    pub fn write_report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "SNAP registers set + action start took {} usec",
            self.setup_us()
        )?;
        if let Some(avg) = self.avg_iteration_us() {
            writeln!(
                out,
                "SNAP action average processing time for {} iteration is {:.6} usec",
                self.max_iteration, avg
            )?;
        }
        Ok(())
    }
}
