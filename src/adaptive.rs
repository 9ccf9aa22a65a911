//! Adaptive choice between serial and parallel rounds.
//!
//! The controller keeps, per mode, running statistics of the ready-set size
//! together with the cumulative time and threads processed in that mode. A
//! round is parallel when its size reaches the current threshold.
//!
//! Before each round, once the admitted round counts of both modes are
//! multiples of `eval_window`, the threshold is re-evaluated against the
//! incoming size. The per-thread cost ratios `time / threads` are compared:
//!
//! - serial dearer: the threshold drops by one if the size is below the
//!   parallel mean;
//! - otherwise it rises by one if the size is above the serial mean.
//!
//! A mode that was never observed has ratio 0, so the controller explores
//! it first. The threshold stays within `[2, max_threshold]`.
//!
//! A finished round only counts when its size falls inside its mode's
//! window. Parallel rounds must stay below `mean + window_sigmas * stddev`
//! and serial rounds above `mean - window_sigmas * stddev`, so a single
//! atypical round cannot drag the statistics away from the threshold.

use std::time::Duration;

use crate::config::AdaptiveConfig;
use crate::types::Mode;

/// Welford running mean and variance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean (or 0 if empty).
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (or 0 with fewer than two samples).
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// `sigmas` standard deviations, never less than one unit so that a run
    /// of identical sizes still admits itself.
    pub fn spread(&self, sigmas: f64) -> f64 {
        (sigmas * self.stddev()).max(1.0)
    }
}

/// Observations of one mode.
#[derive(Debug, Clone, Default)]
pub struct ModeHistory {
    sizes: RunningStats,
    total_time: Duration,
    total_threads: u64,
    rejected: u64,
}

impl ModeHistory {
    /// Rounds folded into the statistics.
    pub fn rounds(&self) -> u64 {
        self.sizes.count()
    }

    /// Rounds that ran in this mode but fell outside its window.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn sizes(&self) -> &RunningStats {
        &self.sizes
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn total_threads(&self) -> u64 {
        self.total_threads
    }

    /// Nanoseconds per processed thread, 0 until the mode was observed.
    pub fn cost_ratio(&self) -> f64 {
        if self.total_threads == 0 {
            0.0
        } else {
            self.total_time.as_nanos() as f64 / self.total_threads as f64
        }
    }

    fn admits(&self, mode: Mode, x: f64, cfg: &AdaptiveConfig) -> bool {
        if self.sizes.count() < cfg.min_samples as u64 {
            return true;
        }
        let spread = self.sizes.spread(cfg.window_sigmas);
        match mode {
            Mode::Parallel => x < self.sizes.mean() + spread,
            Mode::Serial => x > self.sizes.mean() - spread,
        }
    }

    fn record(
        &mut self,
        mode: Mode,
        size: usize,
        elapsed: Duration,
        cfg: &AdaptiveConfig,
    ) -> bool {
        if !self.admits(mode, size as f64, cfg) {
            self.rejected += 1;
            return false;
        }
        self.sizes.push(size as f64);
        self.total_time += elapsed;
        self.total_threads += size as u64;
        true
    }
}

/// Serial/parallel decision maker.
///
/// Drive it with [`update`](Self::update) and [`decide`](Self::decide)
/// before a round, then [`record`](Self::record) once the round finished.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    cfg: AdaptiveConfig,
    threshold: usize,
    rounds: u64,
    history: [ModeHistory; 2],
}

impl AdaptiveController {
    /// `cfg` is taken as is, except that `eval_window` and `max_threshold`
    /// are raised to their smallest meaningful values (1 and 2).
    pub fn new(initial_threshold: usize, mut cfg: AdaptiveConfig) -> Self {
        cfg.eval_window = cfg.eval_window.max(1);
        cfg.max_threshold = cfg.max_threshold.max(2);
        let threshold = initial_threshold.clamp(2, cfg.max_threshold);
        AdaptiveController {
            cfg,
            threshold,
            rounds: 0,
            history: Default::default(),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.cfg
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Rounds recorded, admitted or not.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn history(&self, mode: Mode) -> &ModeHistory {
        &self.history[mode.index()]
    }

    /// Re-evaluate the threshold ahead of a round of `size` threads, if both
    /// modes are at a window boundary.
    pub fn update(&mut self, size: usize) {
        let window = u64::from(self.cfg.eval_window);
        if self.history.iter().all(|h| h.rounds() % window == 0) {
            self.evaluate(size);
        }
    }

    /// Mode for a ready set of `size` threads.
    pub fn decide(&self, size: usize) -> Mode {
        if size >= self.threshold {
            Mode::Parallel
        } else {
            Mode::Serial
        }
    }

    /// Fold a finished round into its mode's statistics, if it lies within
    /// that mode's window.
    pub fn record(&mut self, mode: Mode, size: usize, elapsed: Duration) {
        self.rounds += 1;
        if !self.history[mode.index()].record(mode, size, elapsed, &self.cfg) {
            tracing::trace!(%mode, size, round = self.rounds, "round outside window");
        }
    }

    fn evaluate(&mut self, size: usize) {
        let serial = &self.history[Mode::Serial.index()];
        let parallel = &self.history[Mode::Parallel.index()];
        let n = size as f64;
        let before = self.threshold;

        if serial.cost_ratio() > parallel.cost_ratio() {
            if n < parallel.sizes.mean() {
                self.threshold = self.threshold.saturating_sub(1);
            }
        } else if n > serial.sizes.mean() {
            self.threshold += 1;
        }
        self.threshold = self.threshold.clamp(2, self.cfg.max_threshold);

        if self.threshold != before {
            tracing::debug!(
                from = before,
                to = self.threshold,
                size,
                round = self.rounds,
                "adaptive threshold moved"
            );
        }
    }
}
