//! Termination, cleanup and stack accounting.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use scx_contexts::*;

mod common;

#[test]
fn test_cleanup_and_release_exactly_once() {
    common::setup_test();
    const CYCLES: usize = 10_000;
    let config = ContextConfig::builder().stack_size(64 * 1024).build();
    let mut engine = Engine::configure(config).unwrap();
    let cleanups = Arc::new(AtomicUsize::new(0));

    for i in 0..CYCLES {
        let c = Arc::clone(&cleanups);
        let handle = engine
            .builder()
            .on_exit(move |how| {
                assert!(how.is_normal());
                c.fetch_add(1, Ordering::Relaxed);
            })
            .spawn(move || {
                if i % 2 == 0 {
                    block_current();
                }
            });
        let mut ready = vec![handle];
        while !ready.is_empty() {
            ready = engine.run_ready_set(ready).suspended;
        }
        assert_eq!(cleanups.load(Ordering::Relaxed), i + 1);
    }

    let stacks = engine.stack_stats();
    assert_eq!(stacks.allocated, CYCLES as u64);
    assert_eq!(stacks.released, CYCLES as u64);
    assert_eq!(engine.stats().terminated, CYCLES as u64);
}

#[test]
fn test_cleanup_sees_failure() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    let seen = Arc::new(Mutex::new(None));
    let s = Arc::clone(&seen);
    let handle = engine
        .builder()
        .on_exit(move |how| *s.lock().unwrap() = Some(how.clone()))
        .spawn(|| panic!("entry point exploded"));

    // The failure stays inside the logical thread.
    let report = engine.run_ready_set(vec![handle.clone()]);
    assert_eq!(report.terminated.len(), 1);
    let expected = Termination::Failed("entry point exploded".to_string());
    assert_eq!(handle.termination(), Some(&expected));
    assert_eq!(*seen.lock().unwrap(), Some(expected));
}

#[test]
fn test_kill_before_start_skips_entry() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    let handle = engine.spawn(move || {
        r.fetch_add(1, Ordering::Relaxed);
    });
    handle.kill();
    assert!(handle.is_killed());
    engine.run_ready_set(vec![handle.clone()]);
    assert_eq!(ran.load(Ordering::Relaxed), 0);
    assert_eq!(handle.termination(), Some(&Termination::Killed));
}

#[test]
fn test_drop_engine_unwinds_blocked_threads() {
    common::setup_test();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));

    struct Tracker(Arc<AtomicUsize>);
    impl Drop for Tracker {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    {
        let mut engine = common::serial_engine(BackendChoice::Fastest);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let c = Arc::clone(&cleanups);
                let d = Arc::clone(&dropped);
                engine
                    .builder()
                    .on_exit(move |how| {
                        assert_eq!(how, &Termination::Killed);
                        c.fetch_add(1, Ordering::Relaxed);
                    })
                    .spawn(move || {
                        // Owned by the logical thread's stack frame.
                        let _tracker = Tracker(d);
                        loop {
                            block_current();
                        }
                    })
            })
            .collect();
        engine.run_ready_set(handles);
    }
    // Unwinding ran the destructors living on the logical-thread stacks.
    assert_eq!(cleanups.load(Ordering::Relaxed), 10);
    assert_eq!(dropped.load(Ordering::Relaxed), 10);
}

#[test]
fn test_user_data() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    #[derive(Debug, PartialEq)]
    struct Process {
        pid: u32,
    }
    let handle = engine
        .builder()
        .data(Process { pid: 42 })
        .spawn(|| {
            let me = current().unwrap();
            assert_eq!(me.data::<Process>(), Some(&Process { pid: 42 }));
        });
    assert_eq!(handle.data::<Process>(), Some(&Process { pid: 42 }));
    assert_eq!(handle.data::<u32>(), None);
    engine.run_ready_set(vec![handle.clone()]);
    assert_eq!(handle.termination(), Some(&Termination::Normal));
}

#[test]
fn test_duplicate_in_ready_set_panics() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    let a = engine.spawn(block_current);
    let b = engine.spawn(block_current);

    let err = catch_unwind(AssertUnwindSafe(|| {
        engine.run_ready_set(vec![a.clone(), b.clone(), a.clone()]);
    }))
    .unwrap_err();
    let msg = err.downcast_ref::<String>().unwrap();
    assert!(msg.contains("appears twice"), "{msg}");

    // Nothing was dispatched and the claims were rolled back.
    assert_eq!(a.state(), ActorState::Idle);
    assert_eq!(b.state(), ActorState::Idle);
    engine.run_ready_set(vec![a.clone(), b.clone()]);
    engine.run_ready_set(vec![a.clone(), b.clone()]);
    assert!(a.is_terminated() && b.is_terminated());
}

#[test]
fn test_terminated_thread_cannot_be_dispatched() {
    common::setup_test();
    let mut engine = common::serial_engine(BackendChoice::Fastest);
    let a = engine.spawn(|| {});
    engine.run_ready_set(vec![a.clone()]);
    assert!(a.is_terminated());
    let err = catch_unwind(AssertUnwindSafe(|| {
        engine.run_ready_set(vec![a.clone()]);
    }))
    .unwrap_err();
    let msg = err.downcast_ref::<String>().unwrap();
    assert!(msg.contains("not suspended"), "{msg}");
}

#[test]
fn test_overflow_reporter_can_be_enabled() {
    common::setup_test();
    let config = ContextConfig::builder()
        .stack_size(common::TEST_STACK_SIZE)
        .report_overflow(true)
        .build();
    let mut engine = Engine::configure(config).unwrap();
    let h = engine.spawn(|| {});
    engine.run_ready_set(vec![h]);
    assert_eq!(engine.live_count(), 0);
}
