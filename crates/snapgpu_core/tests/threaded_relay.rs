//! Relay loop against an accelerator running on another thread.
//!
//! Exercises the flag handshake across real cache coherence instead of a
//! peer stepped from inside the wait phase.

use snapgpu_common::addr_type;
use snapgpu_core::buffer::snapshot;
use snapgpu_core::clock::Clock;
use snapgpu_core::descriptor::JobDescriptor;
use snapgpu_core::exchange::{Exchange, ExchangeView};
use snapgpu_core::peer::{Autonomous, Loopback};
use snapgpu_core::relay::{RelayLoop, RelayParams};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

struct InstantClock(Instant);

impl Clock for InstantClock {
    fn now_ns(&self) -> u64 {
        self.0.elapsed().as_nanos() as u64
    }
}

/// Runs the loopback accelerator until it has done `rounds` rounds.
fn accelerator(view: ExchangeView<'_>, rounds: u64, in_window: &AtomicBool) -> u64 {
    let mut peer = Loopback::new(rounds);
    let mut overlaps = 0;
    while !peer.finished() {
        if view.accelerator_may_act() && in_window.load(Ordering::Acquire) {
            overlaps += 1;
        }
        if !peer.try_round(&view) {
            thread::yield_now();
        }
    }
    overlaps
}

#[test]
fn relay_against_threaded_loopback() {
    let exchange = Exchange::allocate(64).unwrap();
    let rounds = 28;
    let in_window = AtomicBool::new(false);

    let overlaps = thread::scope(|s| {
        let remote = exchange.view();
        let in_window = &in_window;
        let worker = s.spawn(move || accelerator(remote, rounds, in_window));

        let mut relay = RelayLoop::new(
            exchange.view(),
            RelayParams {
                max_iteration: rounds,
                hang_timeout_ns: Some(30_000_000_000),
            },
        )
        .unwrap();
        relay.seed().unwrap();
        let clock = InstantClock(Instant::now());
        let timings = relay
            .run(&mut Autonomous, &clock, |echo| {
                in_window.store(true, Ordering::Release);
                assert_eq!(echo.written.last(), echo.received.last().wrapping_mul(2));
                in_window.store(false, Ordering::Release);
            })
            .unwrap();
        assert_eq!(timings.rounds, rounds);
        worker.join().unwrap()
    });

    assert_eq!(overlaps, 0);
    let out = snapshot(exchange.view().to_accel);
    for (k, v) in out.iter().enumerate() {
        assert_eq!(*v, (k as u32).wrapping_mul(2u32.wrapping_pow(rounds as u32)));
    }
}

#[test]
fn accelerator_rebuilt_from_descriptor_addresses() {
    let exchange = Exchange::allocate(4).unwrap();
    let job = JobDescriptor::prepare(4, 2, addr_type::HOST_DRAM, exchange.addresses()).unwrap();
    let window = job.encode();

    let echoes = thread::scope(|s| {
        s.spawn(move || {
            let job = JobDescriptor::decode(&window).unwrap();
            // SAFETY: the exchange outlives the scope.
            let view = unsafe { ExchangeView::from_descriptor(&job) }.unwrap();
            let flag = AtomicBool::new(false);
            accelerator(view, job.max_iteration, &flag)
        });

        let mut relay = RelayLoop::new(
            exchange.view(),
            RelayParams {
                max_iteration: 2,
                hang_timeout_ns: None,
            },
        )
        .unwrap();
        relay.seed().unwrap();
        let mut echoes = Vec::new();
        relay
            .run(&mut Autonomous, &InstantClock(Instant::now()), |echo| {
                echoes.push((echo.received.to_string(), echo.written.to_string()))
            })
            .unwrap();
        echoes
    });

    assert_eq!(
        echoes,
        vec![
            ("[0,1,2, ... , 3]".to_string(), "[0,2,4, ... , 6]".to_string()),
            ("[0,2,4, ... , 6]".to_string(), "[0,4,8, ... , 12]".to_string()),
        ]
    );
}
