//! One training epoch and one evaluation pass.

use crate::data::loader::DataLoader;
use crate::error::MlError;
use crate::eval::{CocoEvaluator, EvalSummary};
use crate::model::{InstanceSegmenter, scalar};
use crate::training::metrics::MetricLogger;
use crate::training::optimizer::{AdamW, GradientBuffer};
use crate::training::scheduler::WarmupSchedule;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSettings {
    /// Micro-batches per optimizer step.
    pub accumulation_steps: usize,
    pub print_freq: usize,
    /// Warm the rate up during epoch 0.
    pub warmup_first_epoch: bool,
}

#[derive(Debug, Clone)]
pub struct EpochOutcome {
    pub metrics: MetricLogger,
    pub batches: usize,
    pub optimizer_steps: usize,
    pub elapsed_secs: f64,
}

impl EpochOutcome {
    /// Mean total loss over the epoch.
    pub fn mean_loss(&self) -> f64 {
        self.metrics.global_avg("loss").unwrap_or(f64::NAN)
    }
}

/// Run every batch of `loader` through `model`, stepping `optimizer` once per
/// `accumulation_steps` micro-batches and once more for a trailing partial
/// window.
pub fn train_one_epoch(
    model: &dyn InstanceSegmenter,
    optimizer: &mut AdamW,
    loader: &DataLoader,
    epoch: usize,
    settings: &EpochSettings,
) -> Result<EpochOutcome, MlError> {
    let accumulation = settings.accumulation_steps.max(1);
    let print_freq = settings.print_freq.max(1);
    let params = model.trainable_parameters()?;
    let base_lr = optimizer.learning_rate();
    let warmup = (epoch == 0 && settings.warmup_first_epoch)
        .then(|| WarmupSchedule::for_epoch(loader.len()));

    let header = format!("Epoch: [{epoch}]");
    let total_batches = loader.len();
    let started = Instant::now();
    let mut metrics = MetricLogger::new();
    let mut buffer = GradientBuffer::new();
    let mut steps = 0;
    let mut batches = 0;

    for (iteration, batch) in loader.epoch_batches(epoch).enumerate() {
        let batch = batch?;
        if let Some(w) = &warmup {
            optimizer.set_learning_rate(base_lr * w.factor(iteration));
        }

        let losses = model.forward_losses(&batch, true)?;
        let total = losses.total()?;
        let loss_value = scalar(&total)?;
        if !loss_value.is_finite() {
            tracing::error!(losses = ?losses.values()?, "non-finite loss");
            return Err(MlError::training(format!(
                "Loss is {loss_value}, stopping training"
            )));
        }

        let grads = total.affine(1.0 / accumulation as f64, 0.0)?.backward()?;
        buffer.accumulate(&grads, &params)?;
        if buffer.micro_batches() == accumulation {
            optimizer.step(&buffer)?;
            buffer.clear();
            steps += 1;
        }

        metrics.update("loss", loss_value);
        for (name, value) in losses.values()? {
            metrics.update(&name, value);
        }
        metrics.set("lr", optimizer.learning_rate());
        batches += 1;

        if iteration % print_freq == 0 || iteration + 1 == total_batches {
            tracing::info!("{}", metrics.log_line(&header, iteration, total_batches));
        }
    }

    if !buffer.is_empty() {
        optimizer.step(&buffer)?;
        buffer.clear();
        steps += 1;
    }
    if warmup.is_some() {
        optimizer.set_learning_rate(base_lr);
    }

    let elapsed_secs = started.elapsed().as_secs_f64();
    tracing::info!(
        "{header} Total time: {elapsed_secs:.1}s ({:.4} s / it)",
        elapsed_secs / batches.max(1) as f64
    );
    Ok(EpochOutcome {
        metrics,
        batches,
        optimizer_steps: steps,
        elapsed_secs,
    })
}

/// Run inference over `loader` and score it.
pub fn evaluate(
    model: &dyn InstanceSegmenter,
    loader: &DataLoader,
    box_threshold: f32,
) -> Result<EvalSummary, MlError> {
    let started = Instant::now();
    let mut evaluator = CocoEvaluator::new();
    for batch in loader.epoch_batches(0) {
        let batch = batch?;
        let detections = model.predict(&batch, box_threshold)?;
        if detections.len() != batch.len() {
            return Err(MlError::evaluation(format!(
                "model returned {} detection lists for {} images",
                detections.len(),
                batch.len()
            )));
        }
        for (target, dets) in batch.targets.iter().zip(detections) {
            evaluator.add(target, dets);
        }
    }
    let summary = evaluator.summarize();
    tracing::info!(
        images = summary.images,
        secs = started.elapsed().as_secs_f64(),
        "evaluation done"
    );
    Ok(summary)
}
