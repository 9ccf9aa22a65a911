//! Context factory: one backend, one stack arena, one id sequence per run.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::arch::EntryFn;
use crate::config::{BackendChoice, ContextConfig};
use crate::context::{Backend, ExecutionContext};
use crate::error::ContextError;
use crate::stack::{ArenaStats, StackArena};
use crate::types::ActorId;

/// Pick the concrete backend for `choice` on this host.
pub fn resolve_backend(choice: BackendChoice) -> Result<Backend, ContextError> {
    let wanted = match choice {
        BackendChoice::Fastest => {
            if Backend::Fast.is_available() {
                Backend::Fast
            } else {
                Backend::Portable
            }
        }
        BackendChoice::Fast => Backend::Fast,
        BackendChoice::Portable => Backend::Portable,
    };
    if !wanted.is_available() {
        return Err(ContextError::UnsupportedBackend {
            backend: wanted.name(),
            arch: std::env::consts::ARCH,
            os: std::env::consts::OS,
        });
    }
    Ok(wanted)
}

#[derive(Debug)]
pub struct ContextFactory {
    backend: Backend,
    arena: StackArena,
    next_id: AtomicU64,
}

impl ContextFactory {
    pub fn new(config: &ContextConfig) -> Result<Self, ContextError> {
        let backend = resolve_backend(config.backend)?;
        let arena = StackArena::new(config.stack_size, config.guard_pages, config.register_stacks)?;
        Ok(ContextFactory {
            backend,
            arena,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn arena(&self) -> &StackArena {
        &self.arena
    }

    pub fn stack_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    pub(crate) fn next_id(&self) -> ActorId {
        ActorId(self.next_id.fetch_add(1, Relaxed))
    }

    /// Stackless context for maestro or a pool participant.
    pub fn bootstrap_context(&self) -> ExecutionContext {
        ExecutionContext::bootstrap(self.backend)
    }

    /// Fresh context with its own stack, starting in `entry(arg)`.
    ///
    /// # Safety
    ///
    /// See [`ExecutionContext::new`].
    pub unsafe fn create_context(
        &self,
        entry: EntryFn,
        arg: *mut c_void,
    ) -> Result<ExecutionContext, ContextError> {
        let stack = self.arena.allocate()?;
        ExecutionContext::new(self.backend, stack, entry, arg)
    }
}
