//! ctxsim: drive a population of logical threads through rounds.
//!
//! Every actor burns a little CPU, blocks, and repeats; rounds run until all
//! of them have terminated. Handy for comparing backends and dispatch modes.

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;

use scx_contexts::{
    block_current, init_logging, BackendChoice, ContextConfig, Engine, FmtBytes, FmtN,
    Parallelism, SynchroMode, Termination,
};

/// Run cooperative logical threads through serial, parallel or adaptive rounds.
#[derive(Parser)]
#[command(name = "ctxsim")]
struct Cli {
    /// Number of logical threads to spawn.
    #[arg(short, long, default_value_t = 1000)]
    actors: usize,

    /// How many times each logical thread blocks before returning.
    #[arg(short, long, default_value_t = 100)]
    blocks: usize,

    /// Busy-loop iterations between two blocks.
    #[arg(short, long, default_value_t = 0)]
    work: u64,

    /// Context backend: fastest, fast (raw) or portable (ucontext).
    #[arg(long, env = "SCX_CTX_FACTORY", default_value = "fastest")]
    backend: BackendChoice,

    /// Dispatch mode: serial, parallel or adaptive.
    #[arg(short, long, env = "SCX_CTX_PARALLEL", default_value = "serial")]
    parallelism: Parallelism,

    /// Pool participants, this thread included. Ignored in serial mode.
    #[arg(short = 'n', long, env = "SCX_CTX_NTHREADS")]
    workers: Option<usize>,

    /// Stack size per logical thread, in KiB.
    #[arg(long, env = "SCX_CTX_STACK_SIZE", default_value_t = 256)]
    stack_kib: usize,

    /// Ready-set size from which rounds run in parallel.
    ///
    /// Fixed threshold in parallel mode; starting point of the adaptive
    /// controller in adaptive mode.
    #[arg(long, env = "SCX_CTX_THRESHOLD")]
    threshold: Option<usize>,

    /// Worker synchronisation: futex, condvar (posix) or busy-wait.
    #[arg(long, env = "SCX_CTX_SYNCHRO")]
    synchro: Option<SynchroMode>,

    /// Pin pool workers to CPUs round-robin.
    #[arg(long)]
    bind: bool,

    /// Print a hint on stack overflow instead of a bare segfault.
    #[arg(long)]
    report_overflow: bool,
}

impl Cli {
    fn config(&self) -> Result<ContextConfig> {
        let Some(stack_size) = self.stack_kib.checked_mul(1024) else {
            bail!("--stack-kib {} is too large", self.stack_kib);
        };
        let workers = match (self.parallelism, self.workers) {
            (Parallelism::Serial, _) => 1,
            (_, Some(n)) => n,
            (_, None) => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2),
        };

        let mut builder = ContextConfig::builder()
            .backend(self.backend)
            .parallelism(self.parallelism)
            .workers(workers)
            .stack_size(stack_size)
            .bind_workers(self.bind)
            .report_overflow(self.report_overflow);
        if let Some(threshold) = self.threshold {
            builder = builder.parallel_threshold(threshold);
        }
        if let Some(synchro) = self.synchro {
            builder = builder.synchro(synchro);
        }
        Ok(builder.build())
    }
}

fn spin(iterations: u64) {
    let mut acc = 0u64;
    for i in 0..iterations {
        acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
    }
    black_box(acc);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = cli.config()?;
    let mut engine = Engine::configure(config).context("failed to configure the context engine")?;

    let failed = Arc::new(AtomicU64::new(0));
    let spawner = engine.spawner();
    for i in 0..cli.actors {
        let (blocks, work) = (cli.blocks, cli.work);
        let failed = Arc::clone(&failed);
        spawner
            .builder()
            .name(format!("actor-{i}"))
            .on_exit(move |how| {
                if !matches!(how, Termination::Normal) {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            })
            .try_spawn(move || {
                for _ in 0..blocks {
                    spin(work);
                    block_current();
                }
                spin(work);
            })
            .with_context(|| format!("failed to spawn logical thread {i}"))?;
    }

    let start = Instant::now();
    let rounds = engine.run_until_idle(usize::MAX);
    let wall = start.elapsed();

    let stats = engine.stats();
    let stacks = engine.stack_stats();
    println!("backend          {}", engine.backend());
    println!("parallelism      {}", engine.config().parallelism);
    println!("workers          {}", engine.config().workers);
    println!(
        "stack            {}",
        FmtBytes(engine.config().stack_size as u64)
    );
    println!("rounds           {}", FmtN(rounds as u64));
    println!("  serial         {}", FmtN(stats.serial_rounds));
    println!("  parallel       {}", FmtN(stats.parallel_rounds));
    println!("resumes          {}", FmtN(stats.resumed));
    println!("terminated       {}", FmtN(stats.terminated));
    println!("failed           {}", failed.load(Ordering::Relaxed));
    println!(
        "stacks           {} allocated, {} released",
        FmtN(stacks.allocated),
        FmtN(stacks.released)
    );
    if let Some(threshold) = engine.threshold() {
        println!("threshold        {threshold}");
    }
    println!("wall             {wall:?}");
    if stats.resumed > 0 {
        let per_resume = wall.as_nanos() / u128::from(stats.resumed);
        println!("per resume       {per_resume}ns");
    }

    if engine.live_count() > 0 {
        bail!("{} logical threads never finished", engine.live_count());
    }
    Ok(())
}
