//! Validated run configuration.
//!
//! The command line accepts signed numbers so that zero and negative
//! sizes reach this module and are refused with a clear diagnostic rather
//! than being wrapped or defaulted.

use crate::error::{Result, RunError};
use clap::ValueEnum;
use std::time::Duration;

/// Which implementation of the action to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// A SNAP card through libsnap.
    Snap,
    /// An in-process thread that plays the action.
    Software,
}

/// Raw values as given on the command line.
#[derive(Debug, Clone)]
pub struct RawConfig {
    pub vector_size: i64,
    pub max_iteration: i64,
    pub card: u32,
    pub backend: BackendKind,
    pub attach_timeout_secs: u64,
    pub completion_timeout_secs: u64,
    pub hang_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub vector_size: usize,
    pub max_iteration: u64,
    pub card: u32,
    pub backend: BackendKind,
    pub attach_timeout: Duration,
    pub completion_timeout: Duration,
    /// `None` restores the unbounded spin.
    pub hang_timeout: Option<Duration>,
}

impl RunConfig {
    /// Largest vector whose byte length fits a 32-bit descriptor size.
    pub const MAX_VECTOR_SIZE: usize = (u32::MAX / 4) as usize;

    /// Checks the raw values before anything is allocated or opened.
    ///
    /// # Returns
    ///
    /// `InvalidConfiguration` for a non-positive size or round count, or a
    /// vector whose byte length overflows the descriptor size field.
    pub fn validate(raw: &RawConfig) -> Result<Self> {
        if raw.vector_size <= 0 {
            return Err(RunError::invalid_configuration(format!(
                "vector_size must be positive, got {}",
                raw.vector_size
            )));
        }
        if raw.max_iteration <= 0 {
            return Err(RunError::invalid_configuration(format!(
                "max_iteration must be positive, got {}",
                raw.max_iteration
            )));
        }
        let vector_size = usize::try_from(raw.vector_size)
            .ok()
            .filter(|&n| n <= Self::MAX_VECTOR_SIZE)
            .ok_or_else(|| {
                RunError::invalid_configuration(format!(
                    "vector_size {} exceeds the maximum of {}",
                    raw.vector_size,
                    Self::MAX_VECTOR_SIZE
                ))
            })?;

        Ok(Self {
            vector_size,
            max_iteration: raw.max_iteration as u64,
            card: raw.card,
            backend: raw.backend,
            attach_timeout: Duration::from_secs(raw.attach_timeout_secs),
            completion_timeout: Duration::from_secs(raw.completion_timeout_secs),
            hang_timeout: (raw.hang_timeout_ms > 0)
                .then(|| Duration::from_millis(raw.hang_timeout_ms)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(vector_size: i64, max_iteration: i64) -> RawConfig {
        RawConfig {
            vector_size,
            max_iteration,
            card: 0,
            backend: BackendKind::Software,
            attach_timeout_secs: 60,
            completion_timeout_secs: 10,
            hang_timeout_ms: 0,
        }
    }

    #[test]
    fn positive_values_pass() {
        let cfg = RunConfig::validate(&raw(1024, 10)).unwrap();
        assert_eq!(cfg.vector_size, 1024);
        assert_eq!(cfg.max_iteration, 10);
        assert_eq!(cfg.hang_timeout, None);
        assert_eq!(cfg.attach_timeout, Duration::from_secs(60));
    }

    #[test]
    fn non_positive_values_are_rejected() {
        for (n, m) in [(0, 1), (-4, 1), (1, 0), (1, -1), (0, 0)] {
            let err = RunConfig::validate(&raw(n, m)).unwrap_err();
            assert_eq!(err.exit_code(), 2, "({n}, {m})");
        }
    }

    #[test]
    fn vector_must_fit_descriptor_size_field() {
        let max = RunConfig::MAX_VECTOR_SIZE as i64;
        assert!(RunConfig::validate(&raw(max, 1)).is_ok());
        assert!(RunConfig::validate(&raw(max + 1, 1)).is_err());
    }

    #[test]
    fn hang_bound_in_milliseconds() {
        let mut r = raw(8, 8);
        r.hang_timeout_ms = 250;
        let cfg = RunConfig::validate(&r).unwrap();
        assert_eq!(cfg.hang_timeout, Some(Duration::from_millis(250)));
    }
}
