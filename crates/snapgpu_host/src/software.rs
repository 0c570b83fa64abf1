//! In-process stand-in for the FPGA action.
//!
//! Decodes the programmed job exactly as the hardware would, rebuilds the
//! exchange from the addresses in it, and plays the accelerator side of the
//! handshake on its own thread. Useful for CI and for measuring the host
//! half of the round trip without a card.

use crate::error::{Result, RunError};
use crate::session::ActionDevice;
use snapgpu_common::retc;
use snapgpu_common::snap::{GPU_LATENCY_EVAL_ACTION_TYPE, JOB_SIZE};
use snapgpu_core::descriptor::JobDescriptor;
use snapgpu_core::exchange::ExchangeView;
use snapgpu_core::peer::Loopback;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Polls between two yields while the action waits for the host.
const SPINS_PER_YIELD: u32 = 256;

struct Worker {
    stop: Arc<AtomicBool>,
    done: Receiver<u32>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct SoftwareDevice {
    card: Option<u32>,
    attached: bool,
    job: Option<JobDescriptor>,
    worker: Option<Worker>,
    /// Return code received before detach, kept for repeated queries.
    retc: Option<u32>,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                warn!("software action panicked");
            }
        }
    }
}

impl ActionDevice for SoftwareDevice {
    fn name(&self) -> &'static str {
        "software"
    }

    fn open_device(&mut self, card: u32) -> Result<()> {
        self.card = Some(card);
        Ok(())
    }

    fn attach_action(
        &mut self,
        action_type: u32,
        _irq_flags: u32,
        _timeout: Duration,
    ) -> Result<()> {
        if self.card.is_none() {
            return Err(RunError::device_unavailable("no card open"));
        }
        if action_type != GPU_LATENCY_EVAL_ACTION_TYPE {
            return Err(RunError::device_unavailable(format!(
                "action type {action_type:#x} not provided by the software card"
            )));
        }
        self.attached = true;
        Ok(())
    }

    fn write_registers(&mut self, job: &[u8; JOB_SIZE]) -> Result<()> {
        if !self.attached {
            return Err(RunError::RegisterWrite { rc: -1 });
        }
        let job = JobDescriptor::decode(job).map_err(|_| RunError::RegisterWrite { rc: -22 })?;
        self.job = Some(job);
        Ok(())
    }

    fn start(&mut self) {
        let Some(job) = self.job else {
            warn!("software action started without a job");
            return;
        };
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, done) = mpsc::channel();
        let worker_stop = stop.clone();

        let spawned = thread::Builder::new()
            .name("software-action".into())
            .spawn(move || {
                // SAFETY: the exchange behind the job outlives the session,
                // and the session joins this thread on detach.
                let view = match unsafe { ExchangeView::from_descriptor(&job) } {
                    Ok(view) => view,
                    Err(e) => {
                        warn!("software action rejected job: {e}");
                        let _ = tx.send(retc::FAILURE);
                        return;
                    }
                };
                let code = run_action(&view, job.max_iteration, &worker_stop);
                let _ = tx.send(code);
            });

        match spawned {
            Ok(handle) => {
                debug!(rounds = job.max_iteration, "software action running");
                self.worker = Some(Worker { stop, done, handle });
            }
            Err(e) => warn!("could not spawn software action: {e}"),
        }
    }

    fn completion_code(&mut self, timeout: Duration) -> u32 {
        if let Some(code) = self.retc {
            return code;
        }
        let Some(worker) = &self.worker else {
            return retc::FAILURE;
        };
        match worker.done.recv_timeout(timeout) {
            Ok(code) => {
                self.retc = Some(code);
                code
            }
            Err(RecvTimeoutError::Timeout) => retc::TIMEOUT,
            Err(RecvTimeoutError::Disconnected) => retc::FAILURE,
        }
    }

    fn detach(&mut self) {
        self.stop_worker();
        self.attached = false;
        self.job = None;
    }

    fn close_device(&mut self) {
        self.card = None;
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Accelerator side of the handshake for `rounds` rounds.
fn run_action(view: &ExchangeView<'_>, rounds: u64, stop: &AtomicBool) -> u32 {
    let mut peer = Loopback::new(rounds);
    let mut idle: u32 = 0;
    while !peer.finished() {
        if stop.load(Ordering::Acquire) {
            return retc::TIMEOUT;
        }
        if peer.try_round(view) {
            idle = 0;
        } else {
            core::hint::spin_loop();
            idle += 1;
            if idle == SPINS_PER_YIELD {
                idle = 0;
                thread::yield_now();
            }
        }
    }
    retc::SUCCESS
}
