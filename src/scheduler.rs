//! Round dispatch ("maestro").
//!
//! A round hands the scheduler a slice of ready logical threads. Two
//! protocols run it to completion:
//!
//! - **Serial**: maestro switches into thread #0. Whenever the running thread
//!   suspends or terminates, it reads the cursor and switches straight to the
//!   next thread, or back to maestro when the slice is exhausted.
//! - **Parallel**: the worker pool maps over the slice. A participant that
//!   claims an index switches from its own body context into that thread.
//!   Suspending threads claim the next index from the pool and chain into
//!   it on the same OS thread; when nothing is left they switch back to the
//!   body of the participant they are running on.
//!
//! The suspend side picks its protocol from the mode of the current round.

use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::actor::{set_current, Actor, ActorHandle};
use crate::context::ExecutionContext;
use crate::factory::ContextFactory;
use crate::pool::WorkerPool;

thread_local! {
    static BODY_SLOT: Cell<usize> = const { Cell::new(usize::MAX) };
}

#[inline(never)]
fn set_body_slot(slot: usize) {
    BODY_SLOT.with(|s| s.set(slot));
}

#[inline(never)]
fn body_slot() -> usize {
    BODY_SLOT.with(|s| s.get())
}

const MODE_SERIAL: u8 = 0;
const MODE_PARALLEL: u8 = 1;

pub(crate) struct Scheduler {
    maestro: ExecutionContext,
    mode: AtomicU8,
    round: AtomicPtr<ActorHandle>,
    round_len: AtomicUsize,
    /// Next serial index to resume.
    cursor: AtomicUsize,
    /// One body context per pool participant.
    bodies: Box<[ExecutionContext]>,
    bodies_claimed: AtomicUsize,
    pool: Option<WorkerPool>,
}

impl Scheduler {
    pub(crate) fn new(factory: &ContextFactory, pool: Option<WorkerPool>) -> Self {
        let participants = pool.as_ref().map_or(0, |p| p.participants());
        let bodies = (0..participants)
            .map(|_| factory.bootstrap_context())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Scheduler {
            maestro: factory.bootstrap_context(),
            mode: AtomicU8::new(MODE_SERIAL),
            round: AtomicPtr::new(std::ptr::null_mut()),
            round_len: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            bodies,
            bodies_claimed: AtomicUsize::new(0),
            pool,
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }

    fn publish(&self, ready: &[ActorHandle], mode: u8) {
        self.round
            .store(ready.as_ptr() as *mut ActorHandle, Ordering::Relaxed);
        self.round_len.store(ready.len(), Ordering::Relaxed);
        self.mode.store(mode, Ordering::Relaxed);
    }

    fn unpublish(&self) {
        self.round.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.round_len.store(0, Ordering::Relaxed);
    }

    fn ready(&self) -> &[ActorHandle] {
        let ptr = self.round.load(Ordering::Relaxed);
        if ptr.is_null() {
            return &[];
        }
        // SAFETY: the slice is published for the duration of the round by
        // the caller of run_serial/run_parallel, which borrows it.
        unsafe { std::slice::from_raw_parts(ptr, self.round_len.load(Ordering::Relaxed)) }
    }

    /// Run `ready` to completion on the calling thread, in order.
    pub(crate) fn run_serial(&self, ready: &[ActorHandle]) {
        let Some(first) = ready.first() else {
            return;
        };
        self.publish(ready, MODE_SERIAL);
        self.cursor.store(1, Ordering::Relaxed);
        tracing::trace!(first = %first.id(), "serial round starts");
        set_current(&*first.0);
        // SAFETY: maestro is the calling flow; `first` is queued and
        // suspended.
        unsafe { self.maestro.switch_to(&first.0.context) };
        self.unpublish();
    }

    /// Run `ready` to completion across the worker pool.
    pub(crate) fn run_parallel(&self, ready: &[ActorHandle]) {
        let Some(pool) = &self.pool else {
            return self.run_serial(ready);
        };
        self.publish(ready, MODE_PARALLEL);
        self.bodies_claimed.store(0, Ordering::Relaxed);
        pool.apply(ready.len(), |i| self.resume_parallel(i));
        self.unpublish();
    }

    fn resume_parallel(&self, index: usize) {
        let actor = &self.ready()[index].0;
        let slot = self.bodies_claimed.fetch_add(1, Ordering::Relaxed);
        set_body_slot(slot);
        set_current(&**actor);
        // SAFETY: each participant claims its own body slot once per round,
        // and the pool hands `index` to exactly one participant.
        unsafe { self.bodies[slot].switch_to(&actor.context) };
    }

    /// Leave the running actor `from` and continue with the round.
    pub(crate) fn suspend(&self, from: &Actor) {
        if self.mode.load(Ordering::Relaxed) == MODE_PARALLEL {
            self.suspend_parallel(from);
        } else {
            self.suspend_serial(from);
        }
    }

    fn suspend_serial(&self, from: &Actor) {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        match self.ready().get(i) {
            Some(next) => {
                tracing::trace!(from = %from.id(), to = %next.id(), "serial chain");
                set_current(&*next.0);
                // SAFETY: serial rounds run on one OS thread, `next` is queued.
                unsafe { from.context.switch_to(&next.0.context) };
            }
            None => {
                set_current(std::ptr::null());
                // SAFETY: maestro was saved when the round started.
                unsafe { from.context.switch_to(&self.maestro) };
            }
        }
    }

    fn suspend_parallel(&self, from: &Actor) {
        let next = self.pool.as_ref().and_then(|p| p.next());
        match next {
            Some(i) => {
                let next = &self.ready()[i].0;
                set_current(&**next);
                // SAFETY: the pool handed index `i` to this thread only.
                unsafe { from.context.switch_to(&next.context) };
            }
            None => {
                set_current(std::ptr::null());
                let slot = body_slot();
                // SAFETY: this OS thread saved itself into `slot` when it
                // started the chain that `from` is part of.
                unsafe { from.context.switch_to(&self.bodies[slot]) };
            }
        }
    }
}
