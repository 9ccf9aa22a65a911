//! Run configuration.
//!
//! A [`ContextConfig`] is assembled with [`ContextConfig::builder`], optionally
//! overridden from `SCX_CTX_*` environment variables, and consumed once by
//! [`Engine::configure`](crate::Engine::configure). Validation happens there,
//! so a configuration value can be built freely and checked late.

use std::fmt;
use std::str::FromStr;

use crate::error::ContextError;

/// Default usable stack size of a logical thread (8 MiB).
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Smallest stack size accepted by validation.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Upper bound on pool participants.
pub const MAX_WORKERS: usize = 1024;

/// Which switching backend the factory binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// The fast backend where the host has one, otherwise portable.
    #[default]
    Fastest,
    /// Hand-written register switch. Fails on unsupported hosts.
    Fast,
    /// C library `ucontext` continuations.
    Portable,
}

/// How ready sets are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    /// Always run rounds on the calling thread.
    #[default]
    Serial,
    /// Run rounds whose size reaches the fixed threshold on the pool.
    Parallel,
    /// Let the adaptive controller move the threshold.
    Adaptive,
}

/// How pool workers wait for and report work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchroMode {
    /// Raw futex words. Linux only.
    Futex,
    /// `Mutex` + `Condvar`.
    Condvar,
    /// Spin with exponential backoff.
    BusyWait,
}

impl Default for SynchroMode {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            SynchroMode::Futex
        } else {
            SynchroMode::Condvar
        }
    }
}

macro_rules! str_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $($name:literal)|+),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ContextError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($($name)|+ => Ok($ty::$variant),)+
                    other => Err(ContextError::config(format!(
                        concat!("unknown ", $what, " '{}'"),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let names: &[&str] = match self {
                    $($ty::$variant => &[$($name),+],)+
                };
                f.write_str(names[0])
            }
        }
    };
}

str_enum!(BackendChoice, "context backend", {
    Fastest => "fastest",
    Fast => "fast" | "raw",
    Portable => "portable" | "ucontext",
});

str_enum!(Parallelism, "parallelism mode", {
    Serial => "serial",
    Parallel => "parallel",
    Adaptive => "adaptive",
});

str_enum!(SynchroMode, "synchronization mode", {
    Futex => "futex",
    Condvar => "condvar" | "posix",
    BusyWait => "busy_wait" | "busy-wait" | "busywait",
});

/// Tuning knobs of the adaptive serial/parallel controller.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Largest threshold the controller may reach.
    pub max_threshold: usize,
    /// Admitted rounds per mode between two threshold evaluations.
    pub eval_window: u32,
    /// Half-width of the admission window, in standard deviations.
    pub window_sigmas: f64,
    /// Rounds a mode folds unconditionally before its window applies.
    pub min_samples: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            max_threshold: 1 << 16,
            eval_window: 5,
            window_sigmas: 1.0,
            min_samples: 4,
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.max_threshold < 2 {
            return Err(ContextError::config("adaptive max_threshold must be >= 2"));
        }
        if self.eval_window == 0 {
            return Err(ContextError::config("adaptive eval_window must be >= 1"));
        }
        if !(self.window_sigmas > 0.0) {
            return Err(ContextError::config("adaptive window_sigmas must be > 0"));
        }
        if self.min_samples < 2 {
            return Err(ContextError::config("adaptive min_samples must be >= 2"));
        }
        Ok(())
    }
}

/// Complete configuration of one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    pub backend: BackendChoice,
    pub parallelism: Parallelism,
    /// Pool participants, the configuring thread included.
    pub workers: usize,
    /// Usable stack bytes per logical thread. Rounded up to whole pages.
    pub stack_size: usize,
    /// Inaccessible pages mapped below each stack.
    pub guard_pages: usize,
    pub synchro: SynchroMode,
    /// Ready-set size from which a round runs on the pool.
    pub parallel_threshold: usize,
    /// Pin pool workers to CPUs round-robin.
    pub bind_workers: bool,
    /// Install a SIGSEGV handler that explains stack overflows.
    pub report_overflow: bool,
    /// Tell Valgrind about every stack. Needs the `valgrind` feature.
    pub register_stacks: bool,
    pub adaptive: AdaptiveConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            backend: BackendChoice::default(),
            parallelism: Parallelism::default(),
            workers: 1,
            stack_size: DEFAULT_STACK_SIZE,
            guard_pages: 1,
            synchro: SynchroMode::default(),
            parallel_threshold: 2,
            bind_workers: false,
            report_overflow: false,
            register_stacks: cfg!(feature = "valgrind"),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl ContextConfig {
    pub fn builder() -> ContextConfigBuilder {
        ContextConfigBuilder {
            config: ContextConfig::default(),
        }
    }

    /// Default configuration with `SCX_CTX_*` overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `SCX_CTX_*` overrides. Unparsable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<BackendChoice>("SCX_CTX_FACTORY") {
            self.backend = v;
        }
        if let Some(v) = env_parse::<Parallelism>("SCX_CTX_PARALLEL") {
            self.parallelism = v;
        }
        if let Some(v) = env_parse::<usize>("SCX_CTX_NTHREADS") {
            self.workers = v;
        }
        if let Some(kib) = env_parse::<usize>("SCX_CTX_STACK_SIZE") {
            self.stack_size = kib.saturating_mul(1024);
        }
        if let Some(v) = env_parse::<usize>("SCX_CTX_GUARD_PAGES") {
            self.guard_pages = v;
        }
        if let Some(v) = env_parse::<SynchroMode>("SCX_CTX_SYNCHRO") {
            self.synchro = v;
        }
        if let Some(v) = env_parse::<usize>("SCX_CTX_THRESHOLD") {
            self.parallel_threshold = v;
        }
    }

    /// Check the configuration for values no backend can honor.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ContextError::config(format!(
                "worker count must be in 1..={MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ContextError::config(format!(
                "stack size must be at least {MIN_STACK_SIZE} bytes, got {}",
                self.stack_size
            )));
        }
        if self.parallel_threshold == 0 {
            return Err(ContextError::config("parallel threshold must be >= 1"));
        }
        if self.parallelism != Parallelism::Serial && self.workers < 2 {
            return Err(ContextError::NoThreadSupport {
                requested: self.workers,
                reason: format!("{} mode needs at least 2 participants", self.parallelism),
            });
        }
        if self.synchro == SynchroMode::Futex && !cfg!(target_os = "linux") {
            return Err(ContextError::config(
                "futex synchronization is only available on Linux",
            ));
        }
        if self.register_stacks && !cfg!(feature = "valgrind") {
            return Err(ContextError::config(
                "stack registration requires the 'valgrind' feature",
            ));
        }
        if self.parallelism == Parallelism::Adaptive {
            self.adaptive.validate()?;
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, "ignoring invalid override: {e}");
            None
        }
    }
}

/// Builder for [`ContextConfig`].
#[derive(Debug, Clone)]
pub struct ContextConfigBuilder {
    config: ContextConfig,
}

impl ContextConfigBuilder {
    pub fn backend(mut self, backend: BackendChoice) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn parallelism(mut self, parallelism: Parallelism) -> Self {
        self.config.parallelism = parallelism;
        self
    }

    /// Shorthand for `parallelism(Serial)`.
    pub fn serial(self) -> Self {
        self.parallelism(Parallelism::Serial)
    }

    /// Fixed-threshold parallel mode with `workers` participants.
    pub fn parallel(self, workers: usize) -> Self {
        self.parallelism(Parallelism::Parallel).workers(workers)
    }

    /// Adaptive mode with `workers` participants.
    pub fn adaptive(self, workers: usize) -> Self {
        self.parallelism(Parallelism::Adaptive).workers(workers)
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n;
        self
    }

    /// Usable stack size in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = bytes;
        self
    }

    pub fn guard_pages(mut self, pages: usize) -> Self {
        self.config.guard_pages = pages;
        self
    }

    pub fn synchro(mut self, mode: SynchroMode) -> Self {
        self.config.synchro = mode;
        self
    }

    pub fn parallel_threshold(mut self, threshold: usize) -> Self {
        self.config.parallel_threshold = threshold;
        self
    }

    pub fn bind_workers(mut self, bind: bool) -> Self {
        self.config.bind_workers = bind;
        self
    }

    pub fn report_overflow(mut self, report: bool) -> Self {
        self.config.report_overflow = report;
        self
    }

    pub fn register_stacks(mut self, register: bool) -> Self {
        self.config.register_stacks = register;
        self
    }

    pub fn adaptive_config(mut self, adaptive: AdaptiveConfig) -> Self {
        self.config.adaptive = adaptive;
        self
    }

    /// Apply `SCX_CTX_*` overrides on top of the values set so far.
    pub fn env_overrides(mut self) -> Self {
        self.config.apply_env();
        self
    }

    pub fn build(self) -> ContextConfig {
        self.config
    }
}
