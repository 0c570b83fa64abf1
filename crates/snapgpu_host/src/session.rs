//! Lifecycle of one attached action.
//!
//! The device layer is whatever actually reaches the action: libsnap on a
//! real card, or the software action. `ActionSession` sits on top of it and
//! makes sure a successfully opened device is detached and closed exactly
//! once on every exit path, including early returns through `?`.

use crate::error::Result;
use snapgpu_common::retc;
use snapgpu_common::snap::JOB_SIZE;
use snapgpu_core::descriptor::JobDescriptor;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Operations the relay needs from the accelerator's driver.
///
/// Calls arrive in lifecycle order: `open_device`, `attach_action`,
/// `write_registers`, `start`, `completion_code`, then `detach` and
/// `close_device`. The session never calls `detach` without a successful
/// attach, nor `close_device` without a successful open.
pub trait ActionDevice {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// `DeviceUnavailable` if the card cannot be opened.
    fn open_device(&mut self, card: u32) -> Result<()>;

    /// # Errors
    ///
    /// `DeviceUnavailable` if the action is not attached within `timeout`.
    fn attach_action(&mut self, action_type: u32, irq_flags: u32, timeout: Duration)
    -> Result<()>;

    /// Copies the job image into the action's register window.
    ///
    /// # Errors
    ///
    /// `RegisterWrite` if the transfer is refused.
    fn write_registers(&mut self, job: &[u8; JOB_SIZE]) -> Result<()>;

    /// Starts the action and returns immediately.
    fn start(&mut self);

    /// Waits up to `timeout` for the action to finish and returns its
    /// return code.
    fn completion_code(&mut self, timeout: Duration) -> u32;

    fn detach(&mut self);

    fn close_device(&mut self);
}

/// Decoded action return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Timeout,
    Failure,
    /// Anything else, kept verbatim.
    Unknown(u32),
}

impl Completion {
    /// Decodes the `retc` field. Unknown codes are kept, not folded into
    /// `Failure`.
    pub fn from_retc(code: u32) -> Self {
        match code {
            retc::SUCCESS => Self::Success,
            retc::TIMEOUT => Self::Timeout,
            retc::FAILURE => Self::Failure,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Timeout => write!(f, "ACTION TIMEOUT"),
            Self::Failure => write!(f, "FAILED"),
            Self::Unknown(code) => write!(f, "UNKNOWN RETC={code:#x}"),
        }
    }
}

/// An opened card with the action attached.
pub struct ActionSession<D: ActionDevice> {
    device: D,
    opened: bool,
    attached: bool,
}

impl<D: ActionDevice> ActionSession<D> {
    /// Opens the card and attaches the action.
    ///
    /// If attaching fails the card is closed again before the error is
    /// returned.
    pub fn acquire(
        device: D,
        card: u32,
        action_type: u32,
        irq_flags: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let mut session = Self {
            device,
            opened: false,
            attached: false,
        };
        let name = session.device.name();

        session.device.open_device(card)?;
        session.opened = true;
        info!(backend = name, card, "device opened");

        session
            .device
            .attach_action(action_type, irq_flags, timeout)
            .inspect_err(|e| warn!(backend = name, "attach failed: {e}"))?;
        session.attached = true;
        info!(
            backend = name,
            action_type = format_args!("{action_type:#x}"),
            "action attached"
        );

        Ok(session)
    }

    /// Programs the job registers, then starts the action without waiting.
    pub fn program_and_launch(&mut self, job: &JobDescriptor) -> Result<()> {
        let image = job.encode();
        debug!(bytes = JobDescriptor::ENCODED_LEN, "writing job registers");
        self.device.write_registers(&image)?;
        self.device.start();
        debug!("action started");
        Ok(())
    }

    /// Waits up to `timeout` for the action and decodes its return code.
    pub fn completion(&mut self, timeout: Duration) -> Completion {
        let code = self.device.completion_code(timeout);
        let completion = Completion::from_retc(code);
        info!(retc = format_args!("{code:#x}"), %completion, "action completed");
        completion
    }

    /// Detaches and closes now instead of at end of scope.
    pub fn release(self) {}
}

impl<D: ActionDevice> Drop for ActionSession<D> {
    fn drop(&mut self) {
        if self.attached {
            self.attached = false;
            self.device.detach();
            debug!("action detached");
        }
        if self.opened {
            self.opened = false;
            self.device.close_device();
            debug!("device closed");
        }
    }
}

/// Devices with injectable faults for lifecycle tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::RunError;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Fault {
        Open,
        Attach,
        RegisterWrite,
        /// The action is started but never takes a turn.
        Stall,
        Retc(u32),
    }

    /// Wraps a device, logs every call, and fails at one chosen point.
    pub struct FaultyDevice<D> {
        pub inner: D,
        pub fault: Option<Fault>,
        pub calls: Rc<RefCell<Vec<&'static str>>>,
    }

    impl<D> FaultyDevice<D> {
        pub fn new(inner: D, fault: Option<Fault>) -> Self {
            Self {
                inner,
                fault,
                calls: Rc::default(),
            }
        }

        fn log(&self, call: &'static str) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl<D: ActionDevice> ActionDevice for FaultyDevice<D> {
        fn name(&self) -> &'static str {
            "faulty"
        }

        fn open_device(&mut self, card: u32) -> Result<()> {
            self.log("open");
            if self.fault == Some(Fault::Open) {
                return Err(RunError::device_unavailable("injected open failure"));
            }
            self.inner.open_device(card)
        }

        fn attach_action(
            &mut self,
            action_type: u32,
            irq: u32,
            timeout: Duration,
        ) -> Result<()> {
            self.log("attach");
            if self.fault == Some(Fault::Attach) {
                return Err(RunError::device_unavailable("injected attach failure"));
            }
            self.inner.attach_action(action_type, irq, timeout)
        }

        fn write_registers(&mut self, job: &[u8; JOB_SIZE]) -> Result<()> {
            self.log("write_registers");
            if self.fault == Some(Fault::RegisterWrite) {
                return Err(RunError::RegisterWrite { rc: -5 });
            }
            self.inner.write_registers(job)
        }

        fn start(&mut self) {
            self.log("start");
            if self.fault != Some(Fault::Stall) {
                self.inner.start();
            }
        }

        fn completion_code(&mut self, timeout: Duration) -> u32 {
            self.log("completion");
            let code = self.inner.completion_code(timeout);
            match self.fault {
                Some(Fault::Retc(forced)) => forced,
                _ => code,
            }
        }

        fn detach(&mut self) {
            self.log("detach");
            self.inner.detach();
        }

        fn close_device(&mut self) {
            self.log("close");
            self.inner.close_device();
        }
    }

    /// Accepts everything and does nothing.
    #[derive(Default)]
    pub struct NullDevice;

    impl ActionDevice for NullDevice {
        fn name(&self) -> &'static str {
            "null"
        }
        fn open_device(&mut self, _card: u32) -> Result<()> {
            Ok(())
        }
        fn attach_action(&mut self, _: u32, _: u32, _: Duration) -> Result<()> {
            Ok(())
        }
        fn write_registers(&mut self, _job: &[u8; JOB_SIZE]) -> Result<()> {
            Ok(())
        }
        fn start(&mut self) {}
        fn completion_code(&mut self, _timeout: Duration) -> u32 {
            retc::SUCCESS
        }
        fn detach(&mut self) {}
        fn close_device(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Fault, FaultyDevice, NullDevice};
    use super::*;
    use snapgpu_common::addr_type;
    use snapgpu_core::exchange::ExchangeAddrs;

    type Session = ActionSession<FaultyDevice<NullDevice>>;

    fn acquire(fault: Option<Fault>) -> (Result<Session>, FaultyDevice<NullDevice>) {
        let device = FaultyDevice::new(NullDevice, fault);
        let observer = FaultyDevice {
            inner: NullDevice,
            fault,
            calls: device.calls.clone(),
        };
        (
            ActionSession::acquire(device, 0, 1, 0, Duration::from_secs(1)),
            observer,
        )
    }

    fn calls(observer: &FaultyDevice<NullDevice>) -> Vec<&'static str> {
        observer.calls.borrow().clone()
    }

    #[test]
    fn open_failure_releases_nothing() {
        let (session, observer) = acquire(Some(Fault::Open));
        assert!(session.is_err());
        assert_eq!(calls(&observer), ["open"]);
    }

    #[test]
    fn attach_failure_closes_the_device_once() {
        let (session, observer) = acquire(Some(Fault::Attach));
        assert_eq!(session.err().map(|e| e.exit_code()), Some(3));
        assert_eq!(calls(&observer), ["open", "attach", "close"]);
    }

    #[test]
    fn register_failure_still_detaches_and_closes() {
        let (session, observer) = acquire(Some(Fault::RegisterWrite));
        let mut session = session.unwrap();
        let job = JobDescriptor::prepare(
            4,
            1,
            addr_type::HOST_DRAM,
            ExchangeAddrs {
                read: 64,
                write: 128,
                read_flag: 192,
                write_flag: 256,
            },
        )
        .unwrap();
        let err = session.program_and_launch(&job).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        drop(session);
        assert_eq!(
            calls(&observer),
            ["open", "attach", "write_registers", "detach", "close"]
        );
    }

    #[test]
    fn explicit_release_does_not_double_release() {
        let (session, observer) = acquire(None);
        let mut session = session.unwrap();
        assert_eq!(session.completion(Duration::ZERO), Completion::Success);
        session.release();
        assert_eq!(
            calls(&observer),
            ["open", "attach", "completion", "detach", "close"]
        );
    }

    #[test]
    fn return_codes_decode() {
        assert_eq!(Completion::from_retc(retc::SUCCESS), Completion::Success);
        assert_eq!(Completion::from_retc(retc::TIMEOUT), Completion::Timeout);
        assert_eq!(Completion::from_retc(retc::FAILURE), Completion::Failure);
        assert_eq!(Completion::from_retc(0x42), Completion::Unknown(0x42));
        assert_eq!(Completion::Unknown(0x42).to_string(), "UNKNOWN RETC=0x42");
    }
}
