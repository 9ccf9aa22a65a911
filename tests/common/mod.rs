#![allow(dead_code)]

use scx_contexts::{
    resolve_backend, BackendChoice, ContextConfig, CtxFormat, Engine, Parallelism,
};

/// Stack size used by test engines. Large enough for `tracing` and
/// formatting inside logical threads, small enough for thousands of them.
pub const TEST_STACK_SIZE: usize = 256 * 1024;

/// Initialize tracing from `RUST_LOG`.
///
/// `try_init()` is idempotent: first call in the process succeeds,
/// subsequent calls are silently ignored.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(CtxFormat)
        .with_test_writer()
        .try_init();
}

/// Whether `backend` can be used on this host. Suites for missing backends
/// pass vacuously.
pub fn has_backend(backend: BackendChoice) -> bool {
    resolve_backend(backend).is_ok()
}

pub fn serial_engine(backend: BackendChoice) -> Engine {
    let config = ContextConfig::builder()
        .backend(backend)
        .stack_size(TEST_STACK_SIZE)
        .build();
    Engine::configure(config).unwrap()
}

/// Engine that runs every non-empty round in parallel.
pub fn parallel_engine(backend: BackendChoice, workers: usize) -> Engine {
    let config = ContextConfig::builder()
        .backend(backend)
        .parallelism(Parallelism::Parallel)
        .workers(workers)
        .parallel_threshold(1)
        .stack_size(TEST_STACK_SIZE)
        .build();
    Engine::configure(config).unwrap()
}

/// Generate a suite of backend-generic tests in module `$name`.
///
/// Usage:
/// ```ignore
/// #[macro_use]
/// mod common;
/// backend_tests!(fast, BackendChoice::Fast);
/// ```
#[macro_export]
macro_rules! backend_tests {
    ($name:ident, $backend:expr) => {
        mod $name {
            use std::sync::atomic::{AtomicUsize, Ordering};
            use std::sync::{Arc, Mutex};

            use scx_contexts::*;

            use crate::common;

            fn backend() -> Option<BackendChoice> {
                let backend = $backend;
                common::has_backend(backend).then_some(backend)
            }

            /// Smoke test: one thread runs to completion in one round.
            #[test]
            fn test_single_thread_completes() {
                common::setup_test();
                let Some(backend) = backend() else { return };
                let mut engine = common::serial_engine(backend);
                let ran = Arc::new(AtomicUsize::new(0));
                let r = Arc::clone(&ran);
                let handle = engine.spawn(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                });
                assert_eq!(handle.state(), ActorState::Idle);

                let report = engine.run_ready_set(vec![handle.clone()]);
                assert_eq!(report.terminated.len(), 1);
                assert!(report.suspended.is_empty());
                assert_eq!(ran.load(Ordering::SeqCst), 1);
                assert_eq!(handle.termination(), Some(&Termination::Normal));
                assert_eq!(engine.live_count(), 0);
            }

            /// Locals survive any number of suspend/resume cycles, including
            /// state held across nested calls.
            #[test]
            fn test_locals_survive_suspension() {
                common::setup_test();
                let Some(backend) = backend() else { return };
                let mut engine = common::serial_engine(backend);
                let out = Arc::new(Mutex::new(Vec::new()));

                fn nested(depth: u64, out: &Mutex<Vec<u64>>) -> u64 {
                    let local = depth * 1000;
                    if depth == 0 {
                        block_current();
                        return local;
                    }
                    let below = nested(depth - 1, out);
                    block_current();
                    out.lock().unwrap().push(local + below);
                    local + below
                }

                let o = Arc::clone(&out);
                let handle = engine.spawn(move || {
                    let total = nested(3, &o);
                    o.lock().unwrap().push(total);
                });

                let mut rounds = 0;
                while !handle.is_terminated() {
                    engine.run_ready_set(vec![handle.clone()]);
                    rounds += 1;
                }
                assert_eq!(rounds, 5);
                assert_eq!(*out.lock().unwrap(), vec![1000, 3000, 6000, 6000]);
            }

            /// Threads run in ready-set order and chain without maestro in
            /// between, for every round.
            #[test]
            fn test_serial_order() {
                common::setup_test();
                let Some(backend) = backend() else { return };
                let mut engine = common::serial_engine(backend);
                let log = Arc::new(Mutex::new(Vec::new()));
                let handles: Vec<_> = (0..8)
                    .map(|i| {
                        let log = Arc::clone(&log);
                        engine.spawn(move || {
                            for round in 0..3 {
                                log.lock().unwrap().push((round, i));
                                block_current();
                            }
                        })
                    })
                    .collect();

                for round in 0..4 {
                    let report = engine.run_ready_set(handles.clone());
                    assert_eq!(report.mode, Mode::Serial);
                    if round < 3 {
                        assert_eq!(report.suspended.len(), 8);
                    } else {
                        assert_eq!(report.terminated.len(), 8);
                    }
                }
                let expected: Vec<_> = (0..3).flat_map(|r| (0..8).map(move |i| (r, i))).collect();
                assert_eq!(*log.lock().unwrap(), expected);
            }

            /// `current()` names the running thread and nothing outside.
            #[test]
            fn test_current_identity() {
                common::setup_test();
                let Some(backend) = backend() else { return };
                let mut engine = common::serial_engine(backend);
                assert!(current().is_none());
                assert_eq!(current_id(), ActorId::MAESTRO);

                let seen = Arc::new(Mutex::new(Vec::new()));
                let handles: Vec<_> = (0..3)
                    .map(|_| {
                        let seen = Arc::clone(&seen);
                        engine.spawn(move || {
                            let me = current().unwrap();
                            seen.lock().unwrap().push(me.id());
                            block_current();
                            assert_eq!(current_id(), me.id());
                        })
                    })
                    .collect();
                engine.run_ready_set(handles.clone());
                engine.run_ready_set(handles.clone());

                let ids: Vec<_> = handles.iter().map(|h| h.id()).collect();
                assert_eq!(*seen.lock().unwrap(), ids);
                assert!(handles.iter().all(|h| h.termination() == Some(&Termination::Normal)));
                assert_eq!(current_id(), ActorId::MAESTRO);
            }

            /// Parallel rounds resume every thread exactly once.
            #[test]
            fn test_parallel_rounds_complete() {
                common::setup_test();
                let Some(backend) = backend() else { return };
                let mut engine = common::parallel_engine(backend, 4);
                let counter = Arc::new(AtomicUsize::new(0));
                let handles: Vec<_> = (0..200)
                    .map(|_| {
                        let counter = Arc::clone(&counter);
                        engine.spawn(move || {
                            for _ in 0..5 {
                                counter.fetch_add(1, Ordering::Relaxed);
                                block_current();
                            }
                        })
                    })
                    .collect();

                let mut ready = handles.clone();
                let mut rounds = 0;
                while !ready.is_empty() {
                    let report = engine.run_ready_set(ready);
                    assert_eq!(report.mode, Mode::Parallel);
                    ready = report.suspended;
                    rounds += 1;
                }
                assert_eq!(rounds, 6);
                assert_eq!(counter.load(Ordering::Relaxed), 1000);
                assert_eq!(engine.stats().parallel_rounds, 6);
                assert!(handles.iter().all(|h| h.is_terminated()));
                drop(handles);
                assert_eq!(engine.stack_stats().live(), 0);
            }

            /// Killing a blocked thread unwinds it and runs its cleanup.
            #[test]
            fn test_kill_blocked_thread() {
                common::setup_test();
                let Some(backend) = backend() else { return };
                let mut engine = common::serial_engine(backend);
                let exits = Arc::new(Mutex::new(Vec::new()));
                let e = Arc::clone(&exits);
                let handle = engine
                    .builder()
                    .on_exit(move |how| e.lock().unwrap().push(how.clone()))
                    .spawn(|| loop {
                        block_current();
                    });

                engine.run_ready_set(vec![handle.clone()]);
                assert_eq!(handle.state(), ActorState::Idle);
                handle.kill();
                let report = engine.run_ready_set(vec![handle.clone()]);
                assert_eq!(report.terminated.len(), 1);
                assert_eq!(*exits.lock().unwrap(), vec![Termination::Killed]);
                assert_eq!(engine.stack_stats().live(), 1);
                drop(report);
                drop(handle);
                assert_eq!(engine.stack_stats().live(), 0);
            }
        }
    };
}
