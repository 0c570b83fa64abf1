//! Errors that end a relay run, and the exit codes they map to.

use snapgpu_core::ProtocolError;
use std::process::ExitCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunError>;

#[derive(Debug, Error)]
pub enum RunError {
    /// Rejected before any memory or device was touched.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// The card could not be opened or the action not attached.
    #[error("device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    /// Transferring the job into the action registers failed.
    #[error("register write failed (rc={rc})")]
    RegisterWrite { rc: i32 },

    /// A wait phase exceeded the configured hang bound.
    #[error("protocol hang in iteration {iteration}: no release after {waited_us} us")]
    ProtocolHang { iteration: u64, waited_us: u64 },

    #[error("action timed out")]
    CompletionTimeout,

    #[error("action failed (retc={retc:#x})")]
    CompletionFailure { retc: u32 },

    /// The action returned a code outside the documented set.
    #[error("action returned unknown code {retc:#x}")]
    CompletionUnknown { retc: u32 },

    /// Shared memory could not be set up.
    #[error("shared memory setup failed: {0}")]
    Memory(ProtocolError),

    #[error("report output failed: {source}")]
    Report {
        #[from]
        source: std::io::Error,
    },
}

impl RunError {
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn device_unavailable(reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            reason: reason.into(),
        }
    }

    /// Process exit status for this error. Success is 0 and never produced
    /// here.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Report { .. } => 1,
            Self::InvalidConfiguration { .. } => 2,
            Self::DeviceUnavailable { .. } => 3,
            Self::RegisterWrite { .. } => 4,
            Self::ProtocolHang { .. } => 5,
            Self::CompletionTimeout => 6,
            Self::CompletionFailure { .. } => 7,
            Self::CompletionUnknown { .. } => 8,
            Self::Memory(_) => 9,
        }
    }
}

impl From<RunError> for ExitCode {
    fn from(err: RunError) -> Self {
        ExitCode::from(err.exit_code())
    }
}

impl From<ProtocolError> for RunError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Hang {
                iteration,
                waited_ns,
            } => Self::ProtocolHang {
                iteration,
                waited_us: waited_ns / 1000,
            },
            ProtocolError::InvalidParameters => Self::invalid_configuration(err.to_string()),
            other => Self::Memory(other),
        }
    }
}
