//! Public facade: configure once, spawn logical threads, run rounds.

use std::alloc::{handle_alloc_error, Layout};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::actor::{current_ptr, Actor, ActorHandle, ActorParts, Cleanup, Termination, IDLE, QUEUED};
use crate::adaptive::AdaptiveController;
use crate::config::{ContextConfig, Parallelism};
use crate::context::Backend;
use crate::error::{fatal, ContextError};
use crate::factory::ContextFactory;
use crate::fmt::FmtBytes;
use crate::guard;
use crate::pool::{PoolOptions, WorkerPool};
use crate::scheduler::Scheduler;
use crate::stack::ArenaStats;
use crate::types::{ActorId, Mode};

/// Rounds spent unwinding killed actors when an engine is dropped.
const TEARDOWN_ROUNDS: usize = 64;

/// State shared by the engine, its spawners and its running actors.
pub(crate) struct Runtime {
    pub(crate) config: ContextConfig,
    pub(crate) factory: ContextFactory,
    pub(crate) scheduler: Scheduler,
    /// Actors not yet terminated, by id.
    registry: Mutex<BTreeMap<ActorId, ActorHandle>>,
}

impl Runtime {
    fn registry(&self) -> MutexGuard<'_, BTreeMap<ActorId, ActorHandle>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self, parts: ActorParts) -> Result<ActorHandle, ContextError> {
        let handle = Actor::create(self, parts)?;
        tracing::trace!(actor = %handle.id(), name = ?handle.name(), "spawned");
        self.registry().insert(handle.id(), handle.clone());
        Ok(handle)
    }

    fn spawn_or_abort(&self, parts: ActorParts) -> ActorHandle {
        match self.spawn(parts) {
            Ok(handle) => handle,
            Err(ContextError::OutOfMemory { size }) => {
                tracing::error!(size, "cannot allocate a logical thread stack");
                let page = self.factory.arena().page_size();
                let layout = Layout::from_size_align(size, page).unwrap_or(Layout::new::<u8>());
                handle_alloc_error(layout)
            }
            Err(e) => fatal(e),
        }
    }
}

/// Outcome of one round.
#[derive(Debug)]
pub struct RoundReport {
    pub mode: Mode,
    pub elapsed: Duration,
    /// Actors that blocked and can appear in a later ready set.
    pub suspended: Vec<ActorHandle>,
    /// Actors that finished during the round.
    pub terminated: Vec<ActorHandle>,
}

impl RoundReport {
    fn empty() -> Self {
        RoundReport {
            mode: Mode::Serial,
            elapsed: Duration::ZERO,
            suspended: Vec::new(),
            terminated: Vec::new(),
        }
    }

    /// Number of actors the round dispatched.
    pub fn len(&self) -> usize {
        self.suspended.len() + self.terminated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cumulative engine counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub serial_rounds: u64,
    pub parallel_rounds: u64,
    /// Total actor resumes across all rounds.
    pub resumed: u64,
    pub terminated: u64,
    pub elapsed: Duration,
}

impl EngineStats {
    pub fn rounds(&self) -> u64 {
        self.serial_rounds + self.parallel_rounds
    }
}

/// A configured context engine.
pub struct Engine {
    runtime: Arc<Runtime>,
    controller: Option<AdaptiveController>,
    stats: EngineStats,
}

impl Engine {
    /// Validate `config`, bind the backend and start the worker pool.
    pub fn configure(config: ContextConfig) -> Result<Self, ContextError> {
        config.validate()?;
        let factory = ContextFactory::new(&config)?;

        if config.report_overflow {
            guard::install(factory.arena().stack_size())?;
        }

        let pool = if config.parallelism == Parallelism::Serial {
            None
        } else {
            Some(WorkerPool::new(
                config.workers,
                PoolOptions {
                    synchro: config.synchro,
                    bind_workers: config.bind_workers,
                    thread_init: config.report_overflow.then_some(guard::init_thread as fn()),
                },
            )?)
        };
        let scheduler = Scheduler::new(&factory, pool);

        let controller = (config.parallelism == Parallelism::Adaptive)
            .then(|| AdaptiveController::new(config.parallel_threshold, config.adaptive.clone()));

        tracing::info!(
            backend = factory.name(),
            parallelism = %config.parallelism,
            workers = config.workers,
            stack = %FmtBytes(factory.arena().stack_size() as u64),
            guard_pages = config.guard_pages,
            "context engine configured"
        );

        Ok(Engine {
            runtime: Arc::new(Runtime {
                config,
                factory,
                scheduler,
                registry: Mutex::new(BTreeMap::new()),
            }),
            controller,
            stats: EngineStats::default(),
        })
    }

    /// Configure from defaults plus `SCX_CTX_*` overrides.
    pub fn from_env() -> Result<Self, ContextError> {
        Self::configure(ContextConfig::from_env())
    }

    pub fn config(&self) -> &ContextConfig {
        &self.runtime.config
    }

    pub fn backend(&self) -> Backend {
        self.runtime.factory.backend()
    }

    /// A cloneable handle that can spawn from anywhere, including from
    /// inside logical threads.
    pub fn spawner(&self) -> Spawner {
        Spawner {
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// Spawn a logical thread. Aborts the process if its stack cannot be
    /// allocated.
    pub fn spawn<F>(&self, entry: F) -> ActorHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.builder().spawn(entry)
    }

    /// Spawn a logical thread, reporting allocation failure.
    pub fn try_spawn<F>(&self, entry: F) -> Result<ActorHandle, ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.builder().try_spawn(entry)
    }

    pub fn builder(&self) -> ActorBuilder {
        self.spawner().builder()
    }

    /// Actors not terminated yet, in id order.
    pub fn live_actors(&self) -> Vec<ActorHandle> {
        self.runtime.registry().values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.runtime.registry().len()
    }

    pub fn stack_stats(&self) -> ArenaStats {
        self.runtime.factory.stack_stats()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Current parallel threshold: the fixed one, the adaptive one, or
    /// `None` in serial mode.
    pub fn threshold(&self) -> Option<usize> {
        match self.runtime.config.parallelism {
            Parallelism::Serial => None,
            Parallelism::Parallel => Some(self.runtime.config.parallel_threshold),
            Parallelism::Adaptive => self.controller.as_ref().map(|c| c.threshold()),
        }
    }

    pub fn controller(&self) -> Option<&AdaptiveController> {
        self.controller.as_ref()
    }

    /// Mode of the next round. In adaptive mode the controller re-evaluates
    /// its threshold against `size` first.
    fn choose_mode(&mut self, size: usize) -> Mode {
        let config = &self.runtime.config;
        match config.parallelism {
            Parallelism::Serial => Mode::Serial,
            Parallelism::Parallel if size >= config.parallel_threshold => Mode::Parallel,
            Parallelism::Parallel => Mode::Serial,
            Parallelism::Adaptive => self.controller.as_mut().map_or(Mode::Serial, |c| {
                c.update(size);
                c.decide(size)
            }),
        }
    }

    /// Resume every actor of `ready` until it blocks or terminates.
    ///
    /// # Panics
    ///
    /// Panics if an actor appears twice, is already terminated, or if called
    /// from inside a logical thread.
    pub fn run_ready_set(&mut self, ready: Vec<ActorHandle>) -> RoundReport {
        assert!(
            current_ptr().is_null(),
            "run_ready_set() called from inside a logical thread"
        );
        if ready.is_empty() {
            return RoundReport::empty();
        }

        for (i, handle) in ready.iter().enumerate() {
            let claimed = handle
                .0
                .state
                .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire);
            if let Err(state) = claimed {
                for h in &ready[..i] {
                    h.0.state.store(IDLE, Ordering::Release);
                }
                let why = if state == QUEUED {
                    "it appears twice in the ready set"
                } else {
                    "it is not suspended"
                };
                panic!("cannot dispatch {}: {why}", handle.id());
            }
        }

        let size = ready.len();
        let mode = self.choose_mode(size);
        let start = Instant::now();
        match mode {
            Mode::Serial => self.runtime.scheduler.run_serial(&ready),
            Mode::Parallel => self.runtime.scheduler.run_parallel(&ready),
        }
        let elapsed = start.elapsed();

        if let Some(controller) = &mut self.controller {
            controller.record(mode, size, elapsed);
        }

        let (terminated, suspended): (Vec<_>, Vec<_>) =
            ready.into_iter().partition(ActorHandle::is_terminated);
        if !terminated.is_empty() {
            let mut registry = self.runtime.registry();
            for handle in &terminated {
                registry.remove(&handle.id());
            }
        }

        match mode {
            Mode::Serial => self.stats.serial_rounds += 1,
            Mode::Parallel => self.stats.parallel_rounds += 1,
        }
        self.stats.resumed += size as u64;
        self.stats.terminated += terminated.len() as u64;
        self.stats.elapsed += elapsed;

        tracing::debug!(
            %mode,
            size,
            terminated = terminated.len(),
            elapsed_ns = elapsed.as_nanos() as u64,
            "round done"
        );

        RoundReport {
            mode,
            elapsed,
            suspended,
            terminated,
        }
    }

    /// Run every live actor, round after round, until none is left or
    /// `max_rounds` rounds have run. Returns the number of rounds.
    pub fn run_until_idle(&mut self, max_rounds: usize) -> usize {
        let mut rounds = 0;
        while rounds < max_rounds {
            let ready = self.live_actors();
            if ready.is_empty() {
                break;
            }
            self.run_ready_set(ready);
            rounds += 1;
        }
        rounds
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let live = self.live_actors();
        if !live.is_empty() && !std::thread::panicking() && current_ptr().is_null() {
            tracing::debug!(live = live.len(), "killing remaining logical threads");
            for handle in &live {
                handle.kill();
            }
            let mut pending = live;
            for _ in 0..TEARDOWN_ROUNDS {
                pending.retain(|h| !h.is_terminated());
                if pending.is_empty() {
                    break;
                }
                self.run_ready_set(pending.clone());
            }
            if !pending.is_empty() {
                tracing::warn!(
                    remaining = pending.len(),
                    "logical threads refused to die; leaking them"
                );
            }
        }
        self.runtime.registry().clear();
        self.runtime.scheduler.shutdown();
    }
}

/// Spawns logical threads into an engine. Cheap to clone.
#[derive(Clone)]
pub struct Spawner {
    runtime: Arc<Runtime>,
}

impl Spawner {
    pub fn builder(&self) -> ActorBuilder {
        ActorBuilder {
            runtime: Arc::clone(&self.runtime),
            name: None,
            cleanup: None,
            data: None,
        }
    }

    pub fn spawn<F>(&self, entry: F) -> ActorHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.builder().spawn(entry)
    }

    pub fn try_spawn<F>(&self, entry: F) -> Result<ActorHandle, ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.builder().try_spawn(entry)
    }
}

/// Configures a logical thread before spawning it.
pub struct ActorBuilder {
    runtime: Arc<Runtime>,
    name: Option<String>,
    cleanup: Option<Cleanup>,
    data: Option<Box<dyn Any + Send + Sync>>,
}

impl ActorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Callback run exactly once when the thread terminates, however it
    /// ends.
    pub fn on_exit<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce(&Termination) + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Attach opaque data, readable through [`ActorHandle::data`].
    pub fn data<T>(mut self, data: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.data = Some(Box::new(data));
        self
    }

    fn into_parts<F>(self, entry: F) -> (Arc<Runtime>, ActorParts)
    where
        F: FnOnce() + Send + 'static,
    {
        let parts = ActorParts {
            name: self.name,
            entry: Box::new(entry),
            cleanup: self.cleanup,
            data: self.data,
        };
        (self.runtime, parts)
    }

    pub fn spawn<F>(self, entry: F) -> ActorHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (runtime, parts) = self.into_parts(entry);
        runtime.spawn_or_abort(parts)
    }

    pub fn try_spawn<F>(self, entry: F) -> Result<ActorHandle, ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (runtime, parts) = self.into_parts(entry);
        runtime.spawn(parts)
    }
}
