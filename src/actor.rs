//! Logical threads.
//!
//! An [`Actor`] owns one execution context with its own stack. Its first
//! resume enters [`actor_main`], which runs the user entry point under
//! `catch_unwind`, runs the cleanup callback exactly once, marks the actor
//! terminated and suspends for good. The stack is unmapped when the last
//! [`ActorHandle`] goes away, which can only happen from another stack.
//!
//! Lifecycle: `Idle -> Queued -> Running -> Idle ... -> Terminated`.
//! `Queued` is set by the round that dispatches the actor, `Running` by the
//! actor itself once resumed, `Idle` by the actor right before it suspends.

use std::any::Any;
use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::context::ExecutionContext;
use crate::engine::Runtime;
use crate::error::{fatal, panic_message, ContextError};
use crate::types::ActorId;

pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type Cleanup = Box<dyn FnOnce(&Termination) + Send + 'static>;

/// How a logical thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The entry point returned.
    Normal,
    /// The entry point panicked; carries the panic message.
    Failed(String),
    /// The thread was killed and unwound.
    Killed,
}

impl Termination {
    pub fn is_normal(&self) -> bool {
        matches!(self, Termination::Normal)
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Idle,
    Queued,
    Running,
    Terminated,
}

pub(crate) const IDLE: u8 = 0;
pub(crate) const QUEUED: u8 = 1;
pub(crate) const RUNNING: u8 = 2;
pub(crate) const TERMINATED: u8 = 3;

fn decode_state(raw: u8) -> ActorState {
    match raw {
        IDLE => ActorState::Idle,
        QUEUED => ActorState::Queued,
        RUNNING => ActorState::Running,
        _ => ActorState::Terminated,
    }
}

/// Unwind payload used to kill a blocked logical thread.
pub(crate) struct ForcedExit;

thread_local! {
    static CURRENT: Cell<*const Actor> = const { Cell::new(std::ptr::null()) };
}

// Thread-local accessors stay out of line: a logical thread may resume on a
// different OS thread, and an inlined access could reuse a stale TLS address.

#[inline(never)]
pub(crate) fn set_current(actor: *const Actor) {
    CURRENT.with(|c| c.set(actor));
}

#[inline(never)]
pub(crate) fn current_ptr() -> *const Actor {
    CURRENT.with(|c| c.get())
}

pub(crate) struct Actor {
    id: ActorId,
    name: Option<String>,
    pub(crate) context: ExecutionContext,
    entry: Mutex<Option<Entry>>,
    cleanup: Mutex<Option<Cleanup>>,
    data: Option<Box<dyn Any + Send + Sync>>,
    pub(crate) state: AtomicU8,
    wants_to_die: AtomicBool,
    termination: OnceLock<Termination>,
    runtime: *const Runtime,
}

// SAFETY: `runtime` is only dereferenced while the actor runs, which only
// happens inside a round driven by the engine that owns the runtime.
unsafe impl Send for Actor {}
unsafe impl Sync for Actor {}

pub(crate) struct ActorParts {
    pub name: Option<String>,
    pub entry: Entry,
    pub cleanup: Option<Cleanup>,
    pub data: Option<Box<dyn Any + Send + Sync>>,
}

impl Actor {
    /// Allocate an actor and its context.
    pub(crate) fn create(runtime: &Runtime, parts: ActorParts) -> Result<ActorHandle, ContextError> {
        let factory = &runtime.factory;
        let mut actor = Arc::new(Actor {
            id: factory.next_id(),
            name: parts.name,
            context: factory.bootstrap_context(),
            entry: Mutex::new(Some(parts.entry)),
            cleanup: Mutex::new(parts.cleanup),
            data: parts.data,
            state: AtomicU8::new(IDLE),
            wants_to_die: AtomicBool::new(false),
            termination: OnceLock::new(),
            runtime: runtime as *const Runtime,
        });
        let arg = Arc::as_ptr(&actor) as *mut c_void;
        // SAFETY: the Arc allocation never moves and outlives every resume
        // of the context, since rounds hold handles to what they run.
        let context = unsafe { factory.create_context(actor_main, arg)? };
        let slot = Arc::get_mut(&mut actor)
            .ok_or_else(|| ContextError::config("actor shared before its context was built"))?;
        slot.context = context;
        Ok(ActorHandle(actor))
    }

    pub(crate) fn id(&self) -> ActorId {
        self.id
    }

    fn runtime(&self) -> &Runtime {
        // SAFETY: see the Send/Sync impls above.
        unsafe { &*self.runtime }
    }

    fn resumed(&self) {
        self.state.store(RUNNING, Ordering::Relaxed);
    }

    /// Suspend the running actor until a later round resumes it.
    ///
    /// Unwinds with [`ForcedExit`] if the actor was killed meanwhile.
    pub(crate) fn block(&self) {
        self.state.store(IDLE, Ordering::Release);
        self.runtime().scheduler.suspend(self);
        self.resumed();
        if self.wants_to_die.load(Ordering::Acquire) {
            resume_unwind(Box::new(ForcedExit));
        }
    }

    fn finish(&self, termination: Termination) {
        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cleanup) = cleanup {
            if catch_unwind(AssertUnwindSafe(|| cleanup(&termination))).is_err() {
                tracing::error!(actor = %self.id, "cleanup callback panicked");
            }
        }
        match &termination {
            Termination::Failed(msg) => {
                tracing::warn!(actor = %self.id, "logical thread failed: {msg}")
            }
            other => tracing::trace!(actor = %self.id, ?other, "logical thread terminated"),
        }
        let _ = self.termination.set(termination);
        self.state.store(TERMINATED, Ordering::Release);
    }
}

/// Body of every logical thread. Never returns.
unsafe extern "C" fn actor_main(arg: *mut c_void) -> ! {
    let actor = &*(arg as *const Actor);
    actor.resumed();
    let termination = run_entry(actor);
    actor.finish(termination);
    actor.runtime().scheduler.suspend(actor);
    fatal(ContextError::config("a terminated logical thread was resumed"))
}

#[inline(never)]
fn run_entry(actor: &Actor) -> Termination {
    if actor.wants_to_die.load(Ordering::Acquire) {
        return Termination::Killed;
    }
    let entry = actor
        .entry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let Some(entry) = entry else {
        return Termination::Normal;
    };
    match catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => Termination::Normal,
        Err(payload) if payload.is::<ForcedExit>() => Termination::Killed,
        Err(payload) => Termination::Failed(panic_message(payload.as_ref())),
    }
}

/// Shared handle to a logical thread.
#[derive(Clone)]
pub struct ActorHandle(pub(crate) Arc<Actor>);

impl ActorHandle {
    pub fn id(&self) -> ActorId {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn state(&self) -> ActorState {
        decode_state(self.0.state.load(Ordering::Acquire))
    }

    pub fn is_terminated(&self) -> bool {
        self.0.state.load(Ordering::Acquire) == TERMINATED
    }

    /// How the thread ended, once it has.
    pub fn termination(&self) -> Option<&Termination> {
        self.0.termination.get()
    }

    /// User data attached at spawn time, if it has type `T`.
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.0.data.as_deref().and_then(|d| d.downcast_ref::<T>())
    }

    /// Ask the thread to die. It unwinds the next time it is resumed, and
    /// never starts its entry point if it has not started yet.
    pub fn kill(&self) {
        self.0.wants_to_die.store(true, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.0.wants_to_die.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same thread.
    pub fn ptr_eq(&self, other: &ActorHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Handle to the actor behind a raw pointer taken from a live handle.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Arc::as_ptr` of an actor that is still alive.
    pub(crate) unsafe fn from_ptr(ptr: *const Actor) -> ActorHandle {
        Arc::increment_strong_count(ptr);
        ActorHandle(Arc::from_raw(ptr))
    }
}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for ActorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ActorHandle {}

/// The logical thread running on this OS thread, if any.
pub fn current() -> Option<ActorHandle> {
    let ptr = current_ptr();
    if ptr.is_null() {
        None
    } else {
        // SAFETY: the running actor is held by the round that resumed it.
        Some(unsafe { ActorHandle::from_ptr(ptr) })
    }
}

/// Id of the running logical thread, or [`ActorId::MAESTRO`].
pub fn current_id() -> ActorId {
    let ptr = current_ptr();
    if ptr.is_null() {
        ActorId::MAESTRO
    } else {
        // SAFETY: as in `current`.
        unsafe { (*ptr).id() }
    }
}

/// Suspend the running logical thread until it appears in a later ready
/// set.
///
/// # Panics
///
/// Panics when called outside a logical thread.
pub fn block_current() {
    let ptr = current_ptr();
    assert!(!ptr.is_null(), "block_current() called outside a logical thread");
    // SAFETY: as in `current`.
    let actor = unsafe { &*ptr };
    actor.block();
}
