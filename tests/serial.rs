//! Serial rounds: ordering, chaining and the external API around them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use scx_contexts::*;

mod common;

#[test]
fn test_order_for_any_length() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    for len in [1usize, 2, 3, 17, 256] {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..len)
            .map(|i| {
                let log = Arc::clone(&log);
                engine.spawn(move || log.lock().unwrap().push(i))
            })
            .collect();
        let report = engine.run_ready_set(handles);
        assert_eq!(report.terminated.len(), len);
        assert_eq!(*log.lock().unwrap(), (0..len).collect::<Vec<_>>());
    }
}

#[test]
fn test_ready_set_order_not_spawn_order() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    let log = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = ["T1", "T2", "T3"]
        .into_iter()
        .map(|name| {
            let log = Arc::clone(&log);
            engine
                .builder()
                .name(name)
                .spawn(move || log.lock().unwrap().push(name))
        })
        .collect();
    let reversed: Vec<_> = handles.iter().rev().cloned().collect();
    engine.run_ready_set(reversed);
    assert_eq!(*log.lock().unwrap(), vec!["T3", "T2", "T1"]);
    assert_eq!(handles[0].name(), Some("T1"));
}

#[test]
fn test_empty_ready_set() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    let report = engine.run_ready_set(Vec::new());
    assert!(report.is_empty());
    assert_eq!(engine.stats().rounds(), 0);
}

#[test]
fn test_subset_rounds_leave_others_untouched() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    let counts: Vec<_> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let handles: Vec<_> = counts
        .iter()
        .map(|c| {
            let c = Arc::clone(c);
            engine.spawn(move || loop {
                c.fetch_add(1, Ordering::Relaxed);
                block_current();
            })
        })
        .collect();

    engine.run_ready_set(vec![handles[1].clone(), handles[3].clone()]);
    engine.run_ready_set(vec![handles[3].clone()]);
    let seen: Vec<_> = counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
    assert_eq!(seen, vec![0, 1, 0, 2]);
    assert_eq!(engine.live_count(), 4);
}

#[test]
fn test_spawn_from_inside_a_thread() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    let spawner = engine.spawner();
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    engine.spawn(move || {
        for i in 0..3 {
            let l2 = Arc::clone(&l);
            spawner.spawn(move || l2.lock().unwrap().push(format!("child {i}")));
        }
        l.lock().unwrap().push("parent".to_string());
    });

    let rounds = engine.run_until_idle(10);
    assert_eq!(rounds, 2);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["parent", "child 0", "child 1", "child 2"]
    );
    assert_eq!(engine.stats().terminated, 4);
}

#[test]
fn test_run_until_idle_respects_limit() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    for _ in 0..3 {
        engine.spawn(|| loop {
            block_current();
        });
    }
    assert_eq!(engine.run_until_idle(5), 5);
    assert_eq!(engine.live_count(), 3);
    assert_eq!(engine.stats().resumed, 15);
}

#[test]
#[should_panic(expected = "outside a logical thread")]
fn test_block_outside_a_thread_panics() {
    block_current();
}
