//! Training metrics: windowed loss smoothing and per-run history.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;

pub const DEFAULT_WINDOW: usize = 20;

/// Tracks a series of values over a sliding window and globally.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: usize,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, value: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.total += value;
        self.count += 1;
    }

    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        // Lower median for even counts.
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        }
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn latest(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Named [`SmoothedValue`]s for one epoch.
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
}

impl MetricLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, name: &str, value: f64) {
        self.meters.entry(name.to_string()).or_default().update(value);
    }

    /// Meter with a window of one, for values that should not be smoothed.
    pub fn set(&mut self, name: &str, value: f64) {
        self.meters
            .entry(name.to_string())
            .or_insert_with(|| SmoothedValue::new(1))
            .update(value);
    }

    pub fn get(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    pub fn global_avg(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(SmoothedValue::global_avg)
    }

    /// `Epoch: [e]  [ i/n]  lr: ...  loss: median (global avg)  ...`
    pub fn log_line(&self, header: &str, iteration: usize, total: usize) -> String {
        let width = total.to_string().len();
        let mut line = format!("{header}  [{iteration:>width$}/{total}]");
        for (name, meter) in &self.meters {
            if meter.window_size == 1 {
                let _ = write!(line, "  {name}: {:.6}", meter.latest());
            } else {
                let _ = write!(line, "  {name}: {:.4} ({:.4})", meter.median(), meter.global_avg());
            }
        }
        line
    }
}

/// Per-run history returned by the trainer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub loss_history: Vec<f64>,
    pub lr_history: Vec<f64>,
    pub custom_metrics: HashMap<String, Vec<f64>>,
    /// Epoch number (0-based) with the lowest training loss.
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_epoch(&mut self, epoch: usize, loss: f64, lr: f64) {
        self.loss_history.push(loss);
        self.lr_history.push(lr);
        self.epochs_completed += 1;

        if self.best_loss.is_none_or(|best| loss < best) {
            self.best_loss = Some(loss);
            self.best_epoch = Some(epoch);
        }
    }

    /// Drop epochs recorded after the first `epochs`, recomputing the best.
    pub fn truncate(&mut self, epochs: usize) {
        self.loss_history.truncate(epochs);
        self.lr_history.truncate(epochs);
        self.epochs_completed = self.epochs_completed.min(epochs);
        self.best_epoch = None;
        self.best_loss = None;
        for (epoch, &loss) in self.loss_history.iter().enumerate() {
            if self.best_loss.is_none_or(|best| loss < best) {
                self.best_loss = Some(loss);
                self.best_epoch = Some(epoch);
            }
        }
    }

    pub fn add_custom_metric(&mut self, name: &str, value: f64) {
        self.custom_metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_smoothed_value_window() {
        let mut v = SmoothedValue::new(3);
        for x in [1.0, 2.0, 3.0, 10.0] {
            v.update(x);
        }
        assert_eq!(v.median(), 3.0);
        assert_eq!(v.avg(), 5.0);
        assert_eq!(v.global_avg(), 4.0);
        assert_eq!(v.count(), 4);
        assert_eq!(v.latest(), 10.0);
    }

    #[test]
    fn test_even_window_uses_lower_median() {
        let mut v = SmoothedValue::new(4);
        for x in [4.0, 1.0, 3.0, 2.0] {
            v.update(x);
        }
        assert_eq!(v.median(), 2.0);
    }

    #[test]
    fn test_metric_logger_line() {
        let mut logger = MetricLogger::new();
        logger.update("loss", 1.0);
        logger.update("loss", 3.0);
        logger.set("lr", 0.01);
        logger.set("lr", 0.005);
        assert_eq!(logger.global_avg("loss"), Some(2.0));
        assert_eq!(
            logger.log_line("Epoch: [0]", 7, 100),
            "Epoch: [0]  [  7/100]  loss: 1.0000 (2.0000)  lr: 0.005000"
        );
    }

    #[test]
    fn test_training_metrics() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(0, 0.5, 0.01);
        metrics.record_epoch(1, 0.3, 0.01);
        metrics.record_epoch(2, 0.4, 0.001);
        assert_eq!(metrics.epochs_completed, 3);
        assert_eq!(metrics.best_epoch, Some(1));
        assert_eq!(metrics.best_loss, Some(0.3));
        assert_eq!(metrics.lr_history, vec![0.01, 0.01, 0.001]);
    }

    #[test]
    fn test_truncate_drops_later_epochs() {
        let mut metrics = TrainingMetrics::default();
        for (epoch, loss) in [0.5, 0.6, 0.2, 0.1].into_iter().enumerate() {
            metrics.record_epoch(epoch, loss, 0.01);
        }
        metrics.truncate(2);
        assert_eq!(metrics.epochs_completed, 2);
        assert_eq!(metrics.loss_history, vec![0.5, 0.6]);
        assert_eq!(metrics.lr_history.len(), 2);
        assert_eq!(metrics.best_epoch, Some(0));
        assert_eq!(metrics.best_loss, Some(0.5));
    }
}
