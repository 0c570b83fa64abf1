//! One complete relay run: allocate, describe, launch, relay, report.

use crate::config::RunConfig;
use crate::error::{Result, RunError};
use crate::session::{ActionDevice, ActionSession, Completion};
use crate::stats::{LatencyStats, RunStatistics};
use snapgpu_common::snap::GPU_LATENCY_EVAL_ACTION_TYPE;
use snapgpu_common::{addr_type, irq, retc};
use snapgpu_core::clock::Clock;
use snapgpu_core::descriptor::JobDescriptor;
use snapgpu_core::exchange::{Exchange, ExchangeAddrs};
use snapgpu_core::peer::Autonomous;
use snapgpu_core::relay::{RelayLoop, RelayParams, RoundEcho};
use std::io::{self, Write};
use std::time::Instant;
use tracing::{debug, info};

/// Monotonic clock anchored at construction.
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// What a successful run measured.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub completion: Completion,
    pub timings: RunStatistics,
    pub rounds: LatencyStats,
}

/// Runs the whole exchange against `device` and writes the report to `out`.
///
/// The device is released on every path. A run that finishes the relay
/// but whose action does not report success still prints the full report
/// before the completion error is returned.
pub fn run_relay<D, W>(config: &RunConfig, device: D, out: &mut W) -> Result<RunSummary>
where
    D: ActionDevice,
    W: Write,
{
    // Declared before the session so the action is detached before the
    // memory it points at goes away.
    let exchange = Exchange::allocate(config.vector_size)?;
    let addrs = exchange.addresses();
    write_parameters(out, config, &addrs)?;

    let job = JobDescriptor::prepare(
        config.vector_size as u64,
        config.max_iteration,
        addr_type::HOST_DRAM,
        addrs,
    )?;
    info!(
        bytes = JobDescriptor::ENCODED_LEN,
        vector_size = config.vector_size,
        max_iteration = config.max_iteration,
        "job descriptor prepared"
    );

    let clock = StdClock::new();
    let mut session = ActionSession::acquire(
        device,
        config.card,
        GPU_LATENCY_EVAL_ACTION_TYPE,
        irq::ACTION_DONE_IRQ | irq::ATTACH_IRQ,
        config.attach_timeout,
    )?;

    let program_ns = clock.now_ns();
    session.program_and_launch(&job)?;
    let launch_ns = clock.now_ns();

    let mut relay = RelayLoop::new(exchange.view(), relay_params(config))?;
    let seeded = relay.seed()?;
    writeln!(out, "*********** Initialization *************")?;
    writeln!(out, "Writting {seeded}")?;

    let mut rounds = LatencyStats::new();
    let mut report_err: Option<io::Error> = None;
    let timings = relay.run(&mut Autonomous, &clock, |echo| {
        rounds.update(echo.round_ns);
        if report_err.is_some() {
            return;
        }
        report_err = write_round(out, echo).err();
    })?;
    if let Some(e) = report_err {
        return Err(e.into());
    }
    debug!(
        rounds = timings.rounds,
        elapsed_ns = timings.elapsed_ns(),
        "relay finished"
    );

    let completion = session.completion(config.completion_timeout);
    writeln!(out, "{completion}")?;

    let stats = RunStatistics {
        program_ns,
        launch_ns,
        loop_start_ns: timings.loop_start_ns,
        loop_end_ns: timings.loop_end_ns,
        max_iteration: config.max_iteration,
    };
    stats.write_report(out)?;
    rounds.write_report(out)?;
    out.flush()?;

    session.release();

    match completion {
        Completion::Success => Ok(RunSummary {
            completion,
            timings: stats,
            rounds,
        }),
        Completion::Timeout => Err(RunError::CompletionTimeout),
        Completion::Failure => Err(RunError::CompletionFailure { retc: retc::FAILURE }),
        Completion::Unknown(code) => Err(RunError::CompletionUnknown { retc: code }),
    }
}

/// Loop parameters for a validated configuration.
///
/// Hang bounds beyond what fits in `u64` nanoseconds saturate rather than
/// wrap, so a huge bound stays effectively unbounded.
fn relay_params(config: &RunConfig) -> RelayParams {
    RelayParams {
        max_iteration: config.max_iteration,
        hang_timeout_ns: config
            .hang_timeout
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
    }
}

fn write_parameters<W: Write>(
    out: &mut W,
    config: &RunConfig,
    addrs: &ExchangeAddrs,
) -> io::Result<()> {
    writeln!(out, "PARAMETERS:")?;
    writeln!(out, "  vector_size:      {}", config.vector_size)?;
    writeln!(out, "  max_iteration:    {}", config.max_iteration)?;
    writeln!(out, "  addr_read:        {:016x}", addrs.read)?;
    writeln!(out, "  addr_write:       {:016x}", addrs.write)?;
    writeln!(out, "  addr_read_flag:   {:016x}", addrs.read_flag)?;
    writeln!(out, "  addr_write_flag:  {:016x}", addrs.write_flag)
}

fn write_round<W: Write>(out: &mut W, echo: &RoundEcho) -> io::Result<()> {
    writeln!(
        out,
        "*********** Interation {}/{} *************",
        echo.iteration, echo.max_iteration
    )?;
    writeln!(out, "Received {}", echo.received)?;
    writeln!(out, "Writting {}", echo.written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, RawConfig};
    use crate::session::testing::{Fault, FaultyDevice};
    use crate::software::SoftwareDevice;
    use rand::Rng;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn config(vector_size: usize, max_iteration: u64) -> RunConfig {
        RunConfig {
            vector_size,
            max_iteration,
            card: 0,
            backend: BackendKind::Software,
            attach_timeout: Duration::from_secs(1),
            completion_timeout: Duration::from_secs(5),
            hang_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn run(
        cfg: &RunConfig,
        fault: Option<Fault>,
    ) -> (Result<RunSummary>, String, Rc<RefCell<Vec<&'static str>>>) {
        let device = FaultyDevice::new(SoftwareDevice::new(), fault);
        let calls = device.calls.clone();
        let mut out = Vec::new();
        let result = run_relay(cfg, device, &mut out);
        (result, String::from_utf8(out).unwrap(), calls)
    }

    fn count(calls: &Rc<RefCell<Vec<&'static str>>>, name: &str) -> usize {
        calls.borrow().iter().filter(|&&c| c == name).count()
    }

    #[test]
    fn two_rounds_over_four_slots() {
        let (result, report, calls) = run(&config(4, 2), None);
        let summary = result.unwrap();
        assert_eq!(summary.completion, Completion::Success);
        assert_eq!(summary.rounds.count, 2);
        assert_eq!(summary.timings.max_iteration, 2);

        assert!(report.starts_with("PARAMETERS:\n  vector_size:      4\n  max_iteration:    2\n"));
        assert!(report.contains(
            "*********** Initialization *************\nWritting [0,1,2, ... , 3]\n"
        ));
        assert!(report.contains(
            "*********** Interation 1/2 *************\n\
             Received [0,1,2, ... , 3]\n\
             Writting [0,2,4, ... , 6]\n"
        ));
        assert!(report.contains(
            "*********** Interation 2/2 *************\n\
             Received [0,2,4, ... , 6]\n\
             Writting [0,4,8, ... , 12]\n"
        ));
        assert!(report.contains("\nSUCCESS\nSNAP registers set + action start took "));
        assert!(report.contains("SNAP action average processing time for 2 iteration is "));

        assert_eq!(
            *calls.borrow(),
            [
                "open",
                "attach",
                "write_registers",
                "start",
                "completion",
                "detach",
                "close"
            ]
        );
    }

    #[test]
    fn random_shapes_run_every_round() {
        let mut rng = rand::thread_rng();
        for _ in 0..8 {
            let n = rng.gen_range(1..=64usize);
            let m = rng.gen_range(1..=6u64);
            let (result, report, _) = run(&config(n, m), None);
            assert_eq!(result.unwrap().rounds.count, m);

            let last = (n as u32 - 1) << m;
            let final_line = report
                .lines()
                .filter(|l| l.starts_with("Writting"))
                .last()
                .unwrap();
            assert!(
                final_line.ends_with(&format!(" {last}]")),
                "n={n} m={m}: {final_line}"
            );
            assert_eq!(report.matches("Interation").count() as u64, m);
        }
    }

    #[test]
    fn oversized_hang_bound_saturates() {
        let raw = RawConfig {
            vector_size: 4,
            max_iteration: 2,
            card: 0,
            backend: BackendKind::Software,
            attach_timeout_secs: 1,
            completion_timeout_secs: 5,
            hang_timeout_ms: 18_446_744_073_710,
        };
        let cfg = RunConfig::validate(&raw).unwrap();
        assert_eq!(relay_params(&cfg).hang_timeout_ns, Some(u64::MAX));

        let (result, _, _) = run(&cfg, None);
        assert_eq!(result.unwrap().rounds.count, 2);
    }

    #[test]
    fn hang_bound_converts_to_nanoseconds() {
        let mut cfg = config(4, 2);
        cfg.hang_timeout = Some(Duration::from_millis(250));
        assert_eq!(relay_params(&cfg).hang_timeout_ns, Some(250_000_000));
        cfg.hang_timeout = None;
        assert_eq!(relay_params(&cfg).hang_timeout_ns, None);
    }

    #[test]
    fn addresses_are_sixteen_hex_digits() {
        let (_, report, _) = run(&config(2, 1), None);
        let line = report
            .lines()
            .find(|l| l.trim_start().starts_with("addr_read:"))
            .unwrap();
        let hex = line.split_whitespace().last().unwrap();
        assert_eq!(hex.len(), 16);
        assert!(u64::from_str_radix(hex, 16).unwrap() % 64 == 0);
    }

    #[test]
    fn open_failure_touches_nothing_else() {
        let (result, report, calls) = run(&config(4, 2), Some(Fault::Open));
        assert_eq!(result.unwrap_err().exit_code(), 3);
        assert_eq!(*calls.borrow(), ["open"]);
        assert!(!report.contains("Initialization"));
    }

    #[test]
    fn attach_failure_closes_once() {
        let (result, _, calls) = run(&config(4, 2), Some(Fault::Attach));
        assert_eq!(result.unwrap_err().exit_code(), 3);
        assert_eq!(count(&calls, "detach"), 0);
        assert_eq!(count(&calls, "close"), 1);
    }

    #[test]
    fn register_failure_aborts_before_the_loop() {
        let (result, report, calls) = run(&config(4, 2), Some(Fault::RegisterWrite));
        assert_eq!(result.unwrap_err().exit_code(), 4);
        assert_eq!(count(&calls, "start"), 0);
        assert_eq!(count(&calls, "detach"), 1);
        assert_eq!(count(&calls, "close"), 1);
        assert!(!report.contains("Interation"));
    }

    #[test]
    fn silent_action_is_reported_as_a_hang() {
        let mut cfg = config(4, 2);
        cfg.hang_timeout = Some(Duration::from_millis(20));
        let (result, _, calls) = run(&cfg, Some(Fault::Stall));
        match result.unwrap_err() {
            RunError::ProtocolHang { iteration, .. } => assert_eq!(iteration, 1),
            other => panic!("expected a hang, got {other:?}"),
        }
        assert_eq!(count(&calls, "completion"), 0);
        assert_eq!(count(&calls, "detach"), 1);
        assert_eq!(count(&calls, "close"), 1);
    }

    #[test]
    fn failing_action_still_reports() {
        let (result, report, calls) = run(&config(4, 1), Some(Fault::Retc(retc::FAILURE)));
        assert_eq!(result.unwrap_err().exit_code(), 7);
        assert!(report.contains("\nFAILED\n"));
        assert!(report.contains("SNAP action average processing time for 1 iteration is "));
        assert_eq!(count(&calls, "detach"), 1);
        assert_eq!(count(&calls, "close"), 1);
    }

    #[test]
    fn unknown_and_timeout_codes_map_to_their_errors() {
        let (timeout, report, _) = run(&config(2, 1), Some(Fault::Retc(retc::TIMEOUT)));
        assert_eq!(timeout.unwrap_err().exit_code(), 6);
        assert!(report.contains("\nACTION TIMEOUT\n"));

        let (unknown, report, _) = run(&config(2, 1), Some(Fault::Retc(0x42)));
        assert!(matches!(
            unknown.unwrap_err(),
            RunError::CompletionUnknown { retc: 0x42 }
        ));
        assert!(report.contains("\nUNKNOWN RETC=0x42\n"));
    }

    #[test]
    fn closed_output_is_a_report_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let device = FaultyDevice::new(SoftwareDevice::new(), None);
        let calls = device.calls.clone();
        let err = run_relay(&config(4, 2), device, &mut Closed).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(calls.borrow().is_empty());
    }
}
