//! Learning-rate schedules: reduce-on-plateau across epochs and a linear
//! warm-up inside the first epoch.

use modista_core::config::SchedulerConfig;
use serde::{Deserialize, Serialize};

/// Persisted scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlateauState {
    /// Lowest metric seen so far; `None` until the first step.
    pub best: Option<f64>,
    pub num_bad_epochs: usize,
    pub cooldown_counter: usize,
    pub last_epoch: usize,
    /// Number of reductions applied.
    pub reductions: usize,
}

/// Reduce the learning rate when a minimised metric stops improving.
///
/// Improvement is absolute: `metric < best - threshold`.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    eps: f64,
    cooldown: usize,
    verbose: bool,
    state: PlateauState,
}

impl PlateauScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            factor: config.factor,
            patience: config.patience,
            threshold: config.threshold,
            min_lr: config.min_lr,
            eps: config.eps,
            cooldown: config.cooldown,
            verbose: config.verbose,
            state: PlateauState::default(),
        }
    }

    /// Record `metric` for one epoch and return the rate to use next.
    pub fn step(&mut self, metric: f64, lr: f64) -> f64 {
        let s = &mut self.state;
        s.last_epoch += 1;

        // A non-finite metric never becomes the best and counts as a bad epoch.
        let improved = metric.is_finite()
            && match s.best {
                None => true,
                Some(best) => metric < best - self.threshold,
            };
        if improved {
            s.best = Some(metric);
            s.num_bad_epochs = 0;
        } else {
            s.num_bad_epochs += 1;
        }

        if s.cooldown_counter > 0 {
            s.cooldown_counter -= 1;
            s.num_bad_epochs = 0;
        }

        if s.num_bad_epochs > self.patience {
            s.cooldown_counter = self.cooldown;
            s.num_bad_epochs = 0;
            let new_lr = (lr * self.factor).max(self.min_lr);
            if lr - new_lr > self.eps {
                s.reductions += 1;
                if self.verbose {
                    tracing::info!(
                        epoch = s.last_epoch,
                        "reducing learning rate to {new_lr:.4e}"
                    );
                }
                return new_lr;
            }
        }
        lr
    }

    pub fn state(&self) -> &PlateauState {
        &self.state
    }

    pub fn load_state(&mut self, state: PlateauState) {
        self.state = state;
    }
}

/// Linear warm-up from `WARMUP_FACTOR` to 1 over the first iterations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupSchedule {
    warmup_iters: usize,
}

pub const WARMUP_FACTOR: f64 = 1.0 / 1000.0;
const MAX_WARMUP_ITERS: usize = 1000;

impl WarmupSchedule {
    /// Warm-up spanning `min(1000, batches - 1)` iterations.
    pub fn for_epoch(batches: usize) -> Self {
        Self {
            warmup_iters: MAX_WARMUP_ITERS.min(batches.saturating_sub(1)),
        }
    }

    pub fn warmup_iters(&self) -> usize {
        self.warmup_iters
    }

    /// Multiplier for the base rate at `iteration` (0-based).
    pub fn factor(&self, iteration: usize) -> f64 {
        if iteration >= self.warmup_iters {
            return 1.0;
        }
        let alpha = iteration as f64 / self.warmup_iters as f64;
        WARMUP_FACTOR * (1.0 - alpha) + alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn scheduler(patience: usize, cooldown: usize) -> PlateauScheduler {
        PlateauScheduler::new(&SchedulerConfig {
            factor: 0.1,
            patience,
            threshold: 1e-4,
            min_lr: 1e-6,
            eps: 1e-8,
            cooldown,
            verbose: false,
        })
    }

    #[test]
    fn test_drops_after_patience_exceeded() {
        let mut s = scheduler(1, 0);
        let mut lr = 0.01;
        lr = s.step(1.0, lr);
        assert_eq!(lr, 0.01);
        // First non-improving epoch: still within patience.
        lr = s.step(1.0, lr);
        assert_eq!(lr, 0.01);
        // Second one exceeds patience.
        lr = s.step(1.0, lr);
        assert!((lr - 0.001).abs() < 1e-12);
        assert_eq!(s.state().num_bad_epochs, 0);
        assert_eq!(s.state().reductions, 1);
    }

    #[test]
    fn test_improvement_must_beat_threshold() {
        let mut s = scheduler(0, 0);
        let lr = s.step(1.0, 0.01);
        // 0.99995 is within the 1e-4 threshold.
        let lr = s.step(0.99995, lr);
        assert!((lr - 0.001).abs() < 1e-12);
        assert_eq!(s.state().best, Some(1.0));
    }

    #[test]
    fn test_cooldown_suppresses_bad_epochs() {
        let mut s = scheduler(0, 2);
        let mut lr = s.step(1.0, 0.01);
        lr = s.step(2.0, lr);
        assert!((lr - 0.001).abs() < 1e-12);
        lr = s.step(2.0, lr);
        lr = s.step(2.0, lr);
        assert!((lr - 0.001).abs() < 1e-12);
        lr = s.step(2.0, lr);
        assert!((lr - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn test_min_lr_floor_and_eps() {
        let mut s = scheduler(0, 0);
        let mut lr = s.step(1.0, 2e-6);
        lr = s.step(1.0, lr);
        assert_eq!(lr, 1e-6);
        // Already at the floor: the change is below eps, nothing happens.
        lr = s.step(1.0, lr);
        assert_eq!(lr, 1e-6);
        assert_eq!(s.state().reductions, 1);
    }

    #[test]
    fn test_nan_metric_is_never_adopted() {
        let mut s = scheduler(1, 0);
        let mut lr = s.step(f64::NAN, 0.01);
        assert_eq!(s.state().best, None);
        assert_eq!(s.state().num_bad_epochs, 1);
        lr = s.step(0.5, lr);
        assert_eq!(lr, 0.01);
        assert_eq!(s.state().best, Some(0.5));
        assert_eq!(s.state().num_bad_epochs, 0);
    }

    #[test]
    fn test_state_roundtrip_via_json() {
        let mut s = scheduler(1, 0);
        s.step(0.5, 0.01);
        s.step(0.7, 0.01);
        let json = serde_json::to_string(s.state()).unwrap();
        let mut fresh = scheduler(1, 0);
        fresh.load_state(serde_json::from_str(&json).unwrap());
        assert_eq!(fresh.state(), s.state());
        assert_eq!(fresh.state().num_bad_epochs, 1);
    }

    #[test]
    fn test_warmup_factor() {
        let w = WarmupSchedule::for_epoch(11);
        assert_eq!(w.warmup_iters(), 10);
        assert!((w.factor(0) - WARMUP_FACTOR).abs() < 1e-12);
        assert!((w.factor(5) - (WARMUP_FACTOR * 0.5 + 0.5)).abs() < 1e-12);
        assert_eq!(w.factor(10), 1.0);
        assert_eq!(WarmupSchedule::for_epoch(1).factor(0), 1.0);
        assert_eq!(WarmupSchedule::for_epoch(5000).warmup_iters(), 1000);
    }

    proptest! {
        #[test]
        fn rate_never_increases_nor_undercuts_floor(
            metrics in proptest::collection::vec(0.0f64..10.0, 1..40),
            patience in 0usize..4,
        ) {
            let mut s = scheduler(patience, 0);
            let mut lr = 0.01;
            for m in metrics {
                let next = s.step(m, lr);
                prop_assert!(next <= lr);
                prop_assert!(next >= 1e-6);
                lr = next;
            }
        }
    }
}
