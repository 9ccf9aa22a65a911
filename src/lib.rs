//! scx_contexts - Cooperative user-space logical threads.
//!
//! Logical threads ("actors") are entry points with their own stacks,
//! multiplexed onto OS threads by explicit context switches. A caller hands
//! the engine a ready set; the engine resumes every member until it blocks
//! or terminates, either on the calling thread or across a worker pool.
//!
//! # Architecture
//!
//! - **Stacks**: `mmap`ed regions with a guard page below each stack
//! - **Contexts**: a raw assembly switch, or `ucontext` as the portable
//!   fallback
//! - **Worker pool**: parallel map with an atomic claim cursor and an
//!   end-of-round barrier
//! - **Scheduler**: serial chaining through the ready set, or parallel
//!   dispatch where suspending threads claim the next index themselves
//! - **Adaptive controller**: learns from round timings whether a ready set
//!   of a given size is cheaper to run serially or in parallel
//!
//! # Usage
//!
//! ```rust,no_run
//! use scx_contexts::*;
//!
//! let mut engine = Engine::configure(ContextConfig::builder().adaptive(4).build())?;
//!
//! for i in 0..100 {
//!     engine.spawn(move || {
//!         for _ in 0..3 {
//!             tracing::info!(i, "working");
//!             block_current();
//!         }
//!     });
//! }
//! let rounds = engine.run_until_idle(usize::MAX);
//! println!("done in {rounds} rounds");
//! # Ok::<(), ContextError>(())
//! ```

pub mod actor;
pub mod adaptive;
mod arch;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod factory;
pub mod fmt;
pub mod guard;
pub mod pool;
mod scheduler;
pub mod stack;
pub mod types;
mod ucontext;

// Re-export the main public types for convenience.
pub use actor::{block_current, current, current_id, ActorHandle, ActorState, Termination};
pub use adaptive::{AdaptiveController, ModeHistory, RunningStats};
pub use arch::EntryFn;
pub use config::{
    AdaptiveConfig, BackendChoice, ContextConfig, ContextConfigBuilder, Parallelism, SynchroMode,
    DEFAULT_STACK_SIZE, MAX_WORKERS, MIN_STACK_SIZE,
};
pub use context::{Backend, ExecutionContext};
pub use engine::{ActorBuilder, Engine, EngineStats, RoundReport, Spawner};
pub use error::{fatal, ContextError};
pub use factory::{resolve_backend, ContextFactory};
pub use fmt::{init_logging, CtxFormat, FmtBytes, FmtN};
pub use pool::{PoolOptions, WorkerPool};
pub use stack::{page_size, ArenaStats, Stack, StackArena};
pub use types::{ActorId, Mode};

static_assertions::assert_impl_all!(ActorHandle: Send, Sync, Clone);
static_assertions::assert_impl_all!(Spawner: Send, Sync, Clone);
static_assertions::assert_impl_all!(Engine: Send);
static_assertions::assert_impl_all!(WorkerPool: Send, Sync);
static_assertions::assert_impl_all!(ContextError: Send, Sync, std::error::Error);
