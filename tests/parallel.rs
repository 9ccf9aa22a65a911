//! Parallel rounds: completeness, thresholds and synchronisation modes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use scx_contexts::*;

mod common;

fn engine(workers: usize, synchro: SynchroMode, threshold: usize) -> Engine {
    let config = ContextConfig::builder()
        .parallel(workers)
        .synchro(synchro)
        .parallel_threshold(threshold)
        .stack_size(common::TEST_STACK_SIZE)
        .build();
    Engine::configure(config).unwrap()
}

fn synchro_modes() -> Vec<SynchroMode> {
    let mut modes = vec![SynchroMode::Condvar, SynchroMode::BusyWait];
    if cfg!(target_os = "linux") {
        modes.push(SynchroMode::Futex);
    }
    modes
}

#[test]
fn test_every_thread_resumed_once_per_round() {
    common::setup_test();
    const K: usize = 2_000;
    for synchro in synchro_modes() {
        let mut engine = engine(8, synchro, 1);
        let hits: Arc<Vec<AtomicU32>> = Arc::new((0..K).map(|_| AtomicU32::new(0)).collect());
        let handles: Vec<_> = (0..K)
            .map(|i| {
                let hits = Arc::clone(&hits);
                engine.spawn(move || {
                    for _ in 0..3 {
                        hits[i].fetch_add(1, Ordering::Relaxed);
                        block_current();
                    }
                })
            })
            .collect();

        for round in 1..=3 {
            let report = engine.run_ready_set(handles.clone());
            assert_eq!(report.mode, Mode::Parallel);
            assert_eq!(report.suspended.len(), K);
            for (i, h) in hits.iter().enumerate() {
                assert_eq!(h.load(Ordering::Relaxed), round, "{synchro}: thread {i}");
            }
        }
        let report = engine.run_ready_set(handles);
        assert_eq!(report.terminated.len(), K);
        assert_eq!(engine.live_count(), 0);
    }
}

#[test]
fn test_rounds_shrink_until_done() {
    common::setup_test();
    let mut engine = engine(4, SynchroMode::default(), 1);
    let threads = Arc::new(Mutex::new(HashSet::new()));
    let handles: Vec<_> = (0..64)
        .map(|i| {
            let threads = Arc::clone(&threads);
            engine.spawn(move || {
                for _ in 0..i % 8 {
                    threads.lock().unwrap().insert(std::thread::current().id());
                    block_current();
                }
            })
        })
        .collect();
    let mut ready = handles;
    let mut sizes = Vec::new();
    while !ready.is_empty() {
        sizes.push(ready.len());
        ready = engine.run_ready_set(ready).suspended;
    }
    assert_eq!(sizes, vec![64, 56, 48, 40, 32, 24, 16, 8]);
    assert_eq!(engine.stats().parallel_rounds, 8);
    assert!(!threads.lock().unwrap().is_empty());
}

#[test]
fn test_current_is_correct_on_workers() {
    common::setup_test();
    let mut engine = engine(4, SynchroMode::default(), 1);
    let mismatches = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..256)
        .map(|_| {
            let mismatches = Arc::clone(&mismatches);
            engine.spawn(move || {
                let me = current_id();
                for _ in 0..10 {
                    block_current();
                    if current_id() != me {
                        mismatches.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    engine.run_until_idle(100);
    assert_eq!(mismatches.load(Ordering::Relaxed), 0);
    assert!(handles.iter().all(|h| h.termination() == Some(&Termination::Normal)));
}

#[test]
fn test_small_rounds_stay_serial_below_threshold() {
    common::setup_test();
    let mut engine = engine(2, SynchroMode::default(), 10);
    assert_eq!(engine.threshold(), Some(10));
    let small: Vec<_> = (0..9).map(|_| engine.spawn(|| {})).collect();
    let large: Vec<_> = (0..10).map(|_| engine.spawn(|| {})).collect();
    assert_eq!(engine.run_ready_set(small).mode, Mode::Serial);
    assert_eq!(engine.run_ready_set(large).mode, Mode::Parallel);
    assert_eq!(engine.stats().serial_rounds, 1);
    assert_eq!(engine.stats().parallel_rounds, 1);
}

#[test]
fn test_parallel_needs_two_participants() {
    common::setup_test();
    let config = ContextConfig::builder()
        .parallelism(Parallelism::Parallel)
        .workers(1)
        .build();
    let err = Engine::configure(config).err().unwrap();
    assert!(matches!(err, ContextError::NoThreadSupport { requested: 1, .. }));
}

#[test]
fn test_failure_in_parallel_round_is_contained() {
    common::setup_test();
    let mut engine = engine(4, SynchroMode::default(), 1);
    let handles: Vec<_> = (0..32)
        .map(|i| {
            engine.spawn(move || {
                block_current();
                if i % 4 == 0 {
                    panic!("thread {i} gave up");
                }
            })
        })
        .collect();
    engine.run_until_idle(10);
    for (i, h) in handles.iter().enumerate() {
        match h.termination() {
            Some(Termination::Failed(msg)) => {
                assert_eq!(i % 4, 0);
                assert_eq!(msg, &format!("thread {i} gave up"));
            }
            Some(Termination::Normal) => assert_ne!(i % 4, 0),
            other => panic!("thread {i}: unexpected {other:?}"),
        }
    }
}
