//! SNAP card access through libsnap.
//!
//! Thin FFI layer over the CAPI SNAP user library. Built only with the
//! `libsnap` feature; without it the backend reports the device as
//! unavailable so the rest of the binary still links on machines without
//! the library.

use crate::error::{Result, RunError};
use crate::session::ActionDevice;
use snapgpu_common::snap::{DEVICE_PATH_PREFIX, DEVICE_PATH_SUFFIX, JOB_SIZE};
use snapgpu_core::descriptor::JobDescriptor;
use std::time::Duration;

/// Bytes of the job window handed to the library.
///
/// Only the encoded job travels; the rest of the register window is left
/// untouched.
#[cfg_attr(not(feature = "libsnap"), allow(dead_code))]
pub const JOB_TRANSFER_LEN: u32 = JobDescriptor::ENCODED_LEN as u32;

/// Path of the AFU device node for a card number.
pub fn device_path(card: u32) -> String {
    format!("{DEVICE_PATH_PREFIX}{card}{DEVICE_PATH_SUFFIX}")
}

#[cfg(feature = "libsnap")]
mod ffi {
    use std::ffi::{c_char, c_int, c_uint};

    #[repr(C)]
    pub struct SnapCard {
        _private: [u8; 0],
    }

    #[repr(C)]
    pub struct SnapAction {
        _private: [u8; 0],
    }

    /// `struct snap_job`: the job window the library copies into MMIO.
    #[repr(C)]
    pub struct SnapJob {
        pub retc: u32,
        pub win_addr: u64,
        pub win_size: u32,
        pub wout_addr: u64,
        pub wout_size: u32,
    }

    #[link(name = "snap")]
    unsafe extern "C" {
        pub fn snap_card_alloc_dev(
            path: *const c_char,
            vendor_id: u16,
            device_id: u16,
        ) -> *mut SnapCard;
        pub fn snap_card_free(card: *mut SnapCard);
        pub fn snap_attach_action(
            card: *mut SnapCard,
            action_type: u32,
            flags: c_uint,
            attach_timeout_sec: c_int,
        ) -> *mut SnapAction;
        pub fn snap_detach_action(action: *mut SnapAction) -> c_int;
        pub fn snap_action_sync_execute_job_set_regs(
            action: *mut SnapAction,
            cjob: *mut SnapJob,
        ) -> c_int;
        pub fn snap_action_start(action: *mut SnapAction) -> c_int;
        pub fn snap_action_sync_execute_job_check_completion(
            action: *mut SnapAction,
            cjob: *mut SnapJob,
            timeout_sec: c_uint,
        ) -> c_int;
    }
}

#[cfg(feature = "libsnap")]
pub use real::SnapDevice;

#[cfg(feature = "libsnap")]
mod real {
    use super::*;
    use snapgpu_common::retc;
    use snapgpu_common::snap::{DEVICE_ID_SNAP, VENDOR_ID_IBM};
    use std::ffi::CString;
    use std::ptr;
    use tracing::warn;

    /// A SNAP card with at most one attached action.
    pub struct SnapDevice {
        card: *mut ffi::SnapCard,
        action: *mut ffi::SnapAction,
        /// Register image the library reads through `job.win_addr`. Boxed
        /// so its address stays put while `job` points at it.
        window: Box<[u8; JOB_SIZE]>,
        job: ffi::SnapJob,
    }

    impl Default for SnapDevice {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SnapDevice {
        pub fn new() -> Self {
            Self {
                card: ptr::null_mut(),
                action: ptr::null_mut(),
                window: Box::new([0; JOB_SIZE]),
                job: ffi::SnapJob {
                    retc: 0,
                    win_addr: 0,
                    win_size: 0,
                    wout_addr: 0,
                    wout_size: 0,
                },
            }
        }
    }

    impl ActionDevice for SnapDevice {
        fn name(&self) -> &'static str {
            "snap"
        }

        fn open_device(&mut self, card: u32) -> Result<()> {
            let path = device_path(card);
            let c_path = CString::new(path.clone())
                .map_err(|_| RunError::device_unavailable("device path contains NUL"))?;
            // SAFETY: c_path is a valid NUL-terminated string for the call.
            let handle = unsafe {
                ffi::snap_card_alloc_dev(c_path.as_ptr(), VENDOR_ID_IBM, DEVICE_ID_SNAP)
            };
            if handle.is_null() {
                return Err(RunError::device_unavailable(format!(
                    "cannot allocate card {path}"
                )));
            }
            self.card = handle;
            Ok(())
        }

        fn attach_action(
            &mut self,
            action_type: u32,
            irq_flags: u32,
            timeout: Duration,
        ) -> Result<()> {
            let secs = i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX);
            // SAFETY: card is a live handle from snap_card_alloc_dev.
            let action =
                unsafe { ffi::snap_attach_action(self.card, action_type, irq_flags, secs) };
            if action.is_null() {
                return Err(RunError::device_unavailable(format!(
                    "cannot attach action {action_type:#x} within {secs} s"
                )));
            }
            self.action = action;
            Ok(())
        }

        fn write_registers(&mut self, job: &[u8; JOB_SIZE]) -> Result<()> {
            self.window.copy_from_slice(job);
            self.job = ffi::SnapJob {
                retc: 0,
                win_addr: self.window.as_ptr() as u64,
                win_size: JOB_TRANSFER_LEN,
                wout_addr: 0,
                wout_size: 0,
            };
            // SAFETY: action is attached and job points at the boxed
            // window, which lives as long as self.
            let rc = unsafe {
                ffi::snap_action_sync_execute_job_set_regs(self.action, &mut self.job)
            };
            if rc != 0 {
                return Err(RunError::RegisterWrite { rc });
            }
            Ok(())
        }

        fn start(&mut self) {
            // SAFETY: action is attached.
            let rc = unsafe { ffi::snap_action_start(self.action) };
            if rc != 0 {
                warn!(rc, "snap_action_start failed");
            }
        }

        fn completion_code(&mut self, timeout: Duration) -> u32 {
            let secs = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
            // SAFETY: action is attached and job was programmed.
            let rc = unsafe {
                ffi::snap_action_sync_execute_job_check_completion(
                    self.action,
                    &mut self.job,
                    secs,
                )
            };
            if rc != 0 && self.job.retc == 0 {
                return retc::TIMEOUT;
            }
            self.job.retc
        }

        fn detach(&mut self) {
            if !self.action.is_null() {
                // SAFETY: action came from snap_attach_action and is
                // detached only here.
                let rc = unsafe { ffi::snap_detach_action(self.action) };
                if rc != 0 {
                    warn!(rc, "snap_detach_action failed");
                }
                self.action = ptr::null_mut();
            }
        }

        fn close_device(&mut self) {
            if !self.card.is_null() {
                // SAFETY: card came from snap_card_alloc_dev and is freed
                // only here.
                unsafe { ffi::snap_card_free(self.card) };
                self.card = ptr::null_mut();
            }
        }
    }
}

#[cfg(not(feature = "libsnap"))]
pub use unavailable::SnapDevice;

#[cfg(not(feature = "libsnap"))]
mod unavailable {
    use super::*;
    use snapgpu_common::retc;

    /// Placeholder when libsnap support is not compiled in.
    #[derive(Default)]
    pub struct SnapDevice;

    impl SnapDevice {
        pub fn new() -> Self {
            Self
        }
    }

    impl ActionDevice for SnapDevice {
        fn name(&self) -> &'static str {
            "snap"
        }

        fn open_device(&mut self, card: u32) -> Result<()> {
            Err(RunError::device_unavailable(format!(
                "{}: built without libsnap support (enable the `libsnap` feature)",
                device_path(card)
            )))
        }

        fn attach_action(&mut self, _: u32, _: u32, _: Duration) -> Result<()> {
            Err(RunError::device_unavailable("no card open"))
        }

        fn write_registers(&mut self, _job: &[u8; JOB_SIZE]) -> Result<()> {
            Err(RunError::RegisterWrite { rc: -1 })
        }

        fn start(&mut self) {}

        fn completion_code(&mut self, _timeout: Duration) -> u32 {
            retc::FAILURE
        }

        fn detach(&mut self) {}

        fn close_device(&mut self) {}
    }
}
