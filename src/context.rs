//! Execution contexts: the saved machine state of one flow of control.
//!
//! A context either owns a stack (a logical thread) or is a bootstrap
//! context, which only receives the state of whatever OS thread switches
//! away through it (maestro and pool participants).
//!
//! [`ExecutionContext::switch_to`] is the only primitive. It takes no lock:
//! the scheduler guarantees that a context is resumed by at most one thread
//! and only after it has been fully saved.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::fmt;

use crate::arch::{self, EntryFn};
use crate::error::{fatal, ContextError};
use crate::stack::Stack;
use crate::ucontext::UContext;

/// Resolved switching backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Fast,
    Portable,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Fast => "fast",
            Backend::Portable => "portable",
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            Backend::Fast => arch::FAST_SWITCH_AVAILABLE,
            Backend::Portable => crate::ucontext::PORTABLE_SWITCH_AVAILABLE,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum SavedState {
    /// Stack pointer of a suspended fast context.
    Fast(UnsafeCell<*mut u8>),
    Portable(UContext),
}

pub struct ExecutionContext {
    state: SavedState,
    // Declared after `state` so the saved state goes first on drop.
    stack: Option<Stack>,
}

// SAFETY: the saved state is only touched by `switch_to`, and the scheduler
// never lets two threads switch into or out of the same context at once.
unsafe impl Send for ExecutionContext {}
unsafe impl Sync for ExecutionContext {}

impl ExecutionContext {
    /// A stackless context that records the state of its first switcher.
    pub fn bootstrap(backend: Backend) -> Self {
        let state = match backend {
            Backend::Fast => SavedState::Fast(UnsafeCell::new(std::ptr::null_mut())),
            Backend::Portable => SavedState::Portable(UContext::bootstrap()),
        };
        ExecutionContext { state, stack: None }
    }

    /// A context that will run `entry(arg)` on `stack` when first switched
    /// to. `entry` must never return.
    ///
    /// # Safety
    ///
    /// `arg` must stay valid for as long as the context can run.
    pub unsafe fn new(
        backend: Backend,
        stack: Stack,
        entry: EntryFn,
        arg: *mut c_void,
    ) -> Result<Self, ContextError> {
        let state = match backend {
            Backend::Fast => {
                SavedState::Fast(UnsafeCell::new(arch::prepare(stack.top(), entry, arg)))
            }
            Backend::Portable => SavedState::Portable(UContext::new(&stack, entry, arg)?),
        };
        Ok(ExecutionContext {
            state,
            stack: Some(stack),
        })
    }

    pub fn backend(&self) -> Backend {
        match self.state {
            SavedState::Fast(_) => Backend::Fast,
            SavedState::Portable(_) => Backend::Portable,
        }
    }

    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }

    /// Suspend the calling flow of control into `self` and resume `to`.
    ///
    /// Returns when another thread or context switches back to `self`.
    ///
    /// # Safety
    ///
    /// The caller must currently be running on `self`, and `to` must be
    /// suspended and not being resumed by anyone else. Thread-local
    /// addresses computed before the call may be stale afterwards, since the
    /// context can come back on another OS thread.
    #[inline(never)]
    pub unsafe fn switch_to(&self, to: &ExecutionContext) {
        match (&self.state, &to.state) {
            (SavedState::Fast(save), SavedState::Fast(restore)) => {
                arch::swap(save.get(), *restore.get());
            }
            (SavedState::Portable(save), SavedState::Portable(restore)) => {
                save.swap(restore);
            }
            _ => fatal(ContextError::config(
                "switch between contexts of different backends",
            )),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("backend", &self.backend())
            .field("stack", &self.stack.as_ref().map(|s| s.usable_size()))
            .finish()
    }
}
