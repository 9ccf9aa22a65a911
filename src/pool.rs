//! Fixed-size worker pool implementing a parallel map.
//!
//! The pool has `participants` members: the thread calling
//! [`WorkerPool::apply`] plus `participants - 1` long-lived OS threads. Each
//! round publishes a fresh item count, wakes the workers, has the caller
//! work alongside them, and returns after every worker has reported back.
//!
//! Items are claimed with a single `fetch_add` on a shared cursor, so every
//! index in `0..len` is handed out exactly once. [`WorkerPool::next`] is the
//! same claim and may be called from inside an item (the scheduler uses it
//! to chain logical threads on one OS thread).
//!
//! Workers wait for rounds in one of three ways ([`SynchroMode`]): raw
//! futex words, a mutex/condvar pair, or spinning with backoff.

use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::utils::{Backoff, CachePadded};

use crate::config::SynchroMode;
use crate::error::{panic_message, ContextError};

// ---------------------------------------------------------------------------
// Futex wrappers
// ---------------------------------------------------------------------------

/// Atomically check `*futex == expected` and sleep until woken.
///
/// Returns immediately (spurious wakeup) if the value has changed.
#[cfg(target_os = "linux")]
fn futex_wait(futex: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake up to `count` threads blocked on `futex`.
#[cfg(target_os = "linux")]
fn futex_wake(futex: &AtomicU32, count: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

// Configuration rejects futex mode elsewhere; spin if it slips through.
#[cfg(not(target_os = "linux"))]
fn futex_wait(_futex: &AtomicU32, _expected: u32) {
    std::hint::spin_loop();
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_futex: &AtomicU32, _count: i32) {}

// ---------------------------------------------------------------------------
// Round synchronization
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CondState {
    round: u32,
    done: usize,
}

enum Synchro {
    /// `round` counts published rounds, `done` counts participants that
    /// finished the current one (the caller included).
    Futex {
        round: CachePadded<AtomicU32>,
        done: CachePadded<AtomicU32>,
    },
    Condvar {
        state: Mutex<CondState>,
        work: Condvar,
        finished: Condvar,
    },
    BusyWait {
        round: CachePadded<AtomicU32>,
        done: CachePadded<AtomicU32>,
    },
}

impl Synchro {
    fn new(mode: SynchroMode) -> Self {
        match mode {
            SynchroMode::Futex => Synchro::Futex {
                round: Default::default(),
                done: Default::default(),
            },
            SynchroMode::Condvar => Synchro::Condvar {
                state: Mutex::new(CondState::default()),
                work: Condvar::new(),
                finished: Condvar::new(),
            },
            SynchroMode::BusyWait => Synchro::BusyWait {
                round: Default::default(),
                done: Default::default(),
            },
        }
    }

    /// Publish a new round. The caller counts as already done.
    fn master_signal(&self) {
        match self {
            Synchro::Futex { round, done } => {
                done.store(1, Ordering::Relaxed);
                round.fetch_add(1, Ordering::Release);
                futex_wake(round, i32::MAX);
            }
            Synchro::Condvar { state, work, .. } => {
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                st.done = 1;
                st.round = st.round.wrapping_add(1);
                work.notify_all();
            }
            Synchro::BusyWait { round, done } => {
                done.store(1, Ordering::Relaxed);
                round.fetch_add(1, Ordering::Release);
            }
        }
    }

    /// Wait until all `participants` have finished the round.
    fn master_wait(&self, participants: usize) {
        match self {
            Synchro::Futex { done, .. } => loop {
                let d = done.load(Ordering::Acquire);
                if d as usize >= participants {
                    break;
                }
                futex_wait(done, d);
            },
            Synchro::Condvar {
                state, finished, ..
            } => {
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                while st.done < participants {
                    st = finished.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
            }
            Synchro::BusyWait { done, .. } => {
                let backoff = Backoff::new();
                while (done.load(Ordering::Acquire) as usize) < participants {
                    backoff.snooze();
                }
            }
        }
    }

    /// Report the end of a round from a worker.
    fn worker_signal(&self, participants: usize) {
        match self {
            Synchro::Futex { done, .. } => {
                let d = done.fetch_add(1, Ordering::AcqRel) + 1;
                if d as usize == participants {
                    futex_wake(done, 1);
                }
            }
            Synchro::Condvar {
                state, finished, ..
            } => {
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                st.done += 1;
                if st.done == participants {
                    finished.notify_one();
                }
            }
            Synchro::BusyWait { done, .. } => {
                done.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Block until round number `expected` is published.
    fn worker_wait(&self, expected: u32) {
        match self {
            Synchro::Futex { round, .. } => loop {
                let r = round.load(Ordering::Acquire);
                if r == expected {
                    break;
                }
                futex_wait(round, r);
            },
            Synchro::Condvar { state, work, .. } => {
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                while st.round != expected {
                    st = work.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
            }
            Synchro::BusyWait { round, .. } => {
                let backoff = Backoff::new();
                while round.load(Ordering::Acquire) != expected {
                    backoff.snooze();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// The function applied to every index of a round.
struct Job<'a> {
    f: &'a (dyn Fn(usize) + Sync),
}

struct PoolShared {
    participants: usize,
    cursor: CachePadded<AtomicUsize>,
    len: AtomicUsize,
    job: AtomicPtr<Job<'static>>,
    destroy: AtomicBool,
    synchro: Synchro,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PoolShared {
    #[inline]
    fn next(&self) -> Option<usize> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        if i < self.len.load(Ordering::Relaxed) {
            Some(i)
        } else {
            None
        }
    }

    /// Claim and run items until the round is exhausted.
    fn work(&self) {
        let job = self.job.load(Ordering::Acquire);
        if job.is_null() {
            return;
        }
        // SAFETY: the job outlives the round; `apply` clears it only after
        // every participant has signalled completion.
        let job = unsafe { &*job };
        while let Some(i) = self.next() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (job.f)(i))) {
                let mut slot = self.panic.lock().unwrap_or_else(PoisonError::into_inner);
                slot.get_or_insert(payload);
            }
        }
    }
}

/// Options for [`WorkerPool::new`].
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub synchro: SynchroMode,
    /// Pin worker `i` to CPU `i % ncpus`.
    pub bind_workers: bool,
    /// Run once on every worker thread before its first round.
    pub thread_init: Option<fn()>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            synchro: SynchroMode::default(),
            bind_workers: false,
            thread_init: None,
        }
    }
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Vec<ThreadId>,
    busy: AtomicBool,
}

impl WorkerPool {
    /// Start `participants - 1` worker threads.
    pub fn new(participants: usize, opts: PoolOptions) -> Result<Self, ContextError> {
        if participants == 0 {
            return Err(ContextError::config("a worker pool needs at least one participant"));
        }
        let shared = Arc::new(PoolShared {
            participants,
            cursor: CachePadded::new(AtomicUsize::new(0)),
            len: AtomicUsize::new(0),
            job: AtomicPtr::new(std::ptr::null_mut()),
            destroy: AtomicBool::new(false),
            synchro: Synchro::new(opts.synchro),
            panic: Mutex::new(None),
        });

        let mut pool = WorkerPool {
            shared,
            threads: Mutex::new(Vec::with_capacity(participants - 1)),
            thread_ids: Vec::with_capacity(participants - 1),
            busy: AtomicBool::new(false),
        };
        for index in 1..participants {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("scx-ctx-worker-{index}"))
                .spawn(move || worker_main(shared, index, opts));
            match spawned {
                Ok(handle) => {
                    pool.thread_ids.push(handle.thread().id());
                    pool.threads
                        .get_mut()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(handle);
                }
                Err(e) => {
                    // Dropping the pool tears down the workers started so far.
                    return Err(ContextError::NoThreadSupport {
                        requested: participants,
                        reason: format!("spawning worker {index} failed: {e}"),
                    });
                }
            }
        }
        tracing::debug!(participants, synchro = %opts.synchro, "worker pool started");
        Ok(pool)
    }

    /// Number of participants, the calling thread included.
    pub fn participants(&self) -> usize {
        self.shared.participants
    }

    /// Run `f(i)` for every `i` in `0..len` across the pool and return once
    /// all of them have completed.
    ///
    /// A panic in `f` is re-raised here after the round has finished.
    pub fn apply<F>(&self, len: usize, f: F)
    where
        F: Fn(usize) + Sync,
    {
        if self.busy.swap(true, Ordering::Acquire) {
            panic!("WorkerPool::apply is not reentrant");
        }
        let job = Job { f: &f };
        let shared = &*self.shared;
        shared
            .job
            .store(&job as *const Job<'_> as *mut Job<'static>, Ordering::Relaxed);
        shared.len.store(len, Ordering::Relaxed);
        shared.cursor.store(0, Ordering::Relaxed);

        shared.synchro.master_signal();
        shared.work();
        shared.synchro.master_wait(shared.participants);

        shared.job.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.busy.store(false, Ordering::Release);

        let payload = shared
            .panic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(payload) = payload {
            resume_unwind(payload);
        }
    }

    /// [`apply`](Self::apply) over the elements of a slice.
    pub fn apply_items<T, F>(&self, items: &[T], f: F)
    where
        T: Sync,
        F: Fn(&T) + Sync,
    {
        self.apply(items.len(), |i| f(&items[i]))
    }

    /// Claim the next unprocessed index of the current round.
    #[inline]
    pub fn next(&self) -> Option<usize> {
        self.shared.next()
    }

    /// Stop and join the workers. Idempotent.
    ///
    /// When called from one of the pool's own workers the threads are
    /// detached instead of joined. Returns how many workers died from a
    /// panic; each one is logged.
    pub fn shutdown(&self) -> usize {
        if self.shared.destroy.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.shared.synchro.master_signal();
        let handles =
            std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        let me = thread::current().id();
        if self.thread_ids.contains(&me) {
            tracing::warn!("worker pool dropped from its own worker; detaching threads");
            return 0;
        }
        let mut failed = 0;
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if let Err(payload) = handle.join() {
                failed += 1;
                tracing::warn!(
                    worker = %name,
                    "worker thread panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        tracing::debug!(participants = self.shared.participants, failed, "worker pool stopped");
        failed
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(shared: Arc<PoolShared>, index: usize, opts: PoolOptions) {
    if opts.bind_workers {
        bind_to_cpu(index);
    }
    if let Some(init) = opts.thread_init {
        init();
    }
    let mut round = 0u32;
    loop {
        round = round.wrapping_add(1);
        shared.synchro.worker_wait(round);
        if shared.destroy.load(Ordering::Acquire) {
            break;
        }
        shared.work();
        shared.synchro.worker_signal(shared.participants);
    }
}

#[cfg(target_os = "linux")]
fn bind_to_cpu(index: usize) {
    let ncpus = thread::available_parallelism().map_or(1, |n| n.get());
    let cpu = index % ncpus;
    // SAFETY: cpu_set_t is plain data, manipulated through the libc macros.
    let ret = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        tracing::warn!(
            worker = index,
            cpu,
            "binding worker failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_cpu(index: usize) {
    tracing::warn!(worker = index, "worker CPU binding is only supported on Linux");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn modes() -> Vec<SynchroMode> {
        let mut modes = vec![SynchroMode::Condvar, SynchroMode::BusyWait];
        if cfg!(target_os = "linux") {
            modes.push(SynchroMode::Futex);
        }
        modes
    }

    #[test]
    fn test_single_participant_runs_inline() {
        let pool = WorkerPool::new(1, PoolOptions::default()).unwrap();
        let sum = AtomicU64::new(0);
        pool.apply(100, |i| {
            sum.fetch_add(i as u64, Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 4950);
    }

    #[test]
    fn test_rounds_repeat() {
        for synchro in modes() {
            let pool = WorkerPool::new(
                4,
                PoolOptions {
                    synchro,
                    ..PoolOptions::default()
                },
            )
            .unwrap();
            let count = AtomicU64::new(0);
            for round in 0..200 {
                pool.apply(round % 17, |_| {
                    count.fetch_add(1, Ordering::Relaxed);
                });
            }
            let expected: u64 = (0..200u64).map(|r| r % 17).sum();
            assert_eq!(count.load(Ordering::Relaxed), expected, "{synchro}");
        }
    }

    #[test]
    fn test_next_chains_inside_item() {
        let pool = WorkerPool::new(3, PoolOptions::default()).unwrap();
        let hits: Vec<AtomicU64> = (0..500).map(|_| AtomicU64::new(0)).collect();
        pool.apply(hits.len(), |first| {
            let mut i = Some(first);
            while let Some(idx) = i {
                hits[idx].fetch_add(1, Ordering::Relaxed);
                i = pool.next();
            }
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_panic_is_reraised_after_round() {
        let pool = WorkerPool::new(2, PoolOptions::default()).unwrap();
        let done = AtomicU64::new(0);
        let res = catch_unwind(AssertUnwindSafe(|| {
            pool.apply(10, |i| {
                if i == 3 {
                    panic!("item {i} failed");
                }
                done.fetch_add(1, Ordering::Relaxed);
            })
        }));
        assert!(res.is_err());
        assert_eq!(done.load(Ordering::Relaxed), 9);
        // The pool stays usable.
        pool.apply(4, |_| {
            done.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(done.load(Ordering::Relaxed), 13);
    }

    #[test]
    fn test_shutdown_reports_failed_workers() {
        fn failing_init() {
            panic!("worker init failed");
        }
        let pool = WorkerPool::new(
            3,
            PoolOptions {
                thread_init: Some(failing_init),
                ..PoolOptions::default()
            },
        )
        .unwrap();
        assert_eq!(pool.shutdown(), 2);
        assert_eq!(pool.shutdown(), 0);
    }

    #[test]
    fn test_clean_shutdown() {
        let pool = WorkerPool::new(3, PoolOptions::default()).unwrap();
        pool.apply(8, |_| {});
        assert_eq!(pool.shutdown(), 0);
    }
}
