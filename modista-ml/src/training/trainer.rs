//! Epoch loop with checkpointing, plateau scheduling and periodic evaluation.

use crate::data::annotations::CategoryTable;
use crate::data::dataset::SegmentationDataset;
use crate::data::loader::{Batch, DataLoader};
use crate::device::gpu_memory_report;
use crate::error::MlError;
use crate::eval::EvalSummary;
use crate::model::InstanceSegmenter;
use crate::training::checkpoint::{load_checkpoint, save_checkpoint};
use crate::training::engine::{EpochSettings, evaluate, train_one_epoch};
use crate::training::metrics::TrainingMetrics;
use crate::training::optimizer::AdamW;
use crate::training::scheduler::PlateauScheduler;
use crate::visualize::Visualizer;
use modista_core::persistence::{atomic_write_json, load_json};
use modista_core::{RunLog, RunPaths, TrainConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub struct Trainer {
    config: TrainConfig,
    fingerprint: String,
    model: Box<dyn InstanceSegmenter>,
    optimizer: AdamW,
    scheduler: PlateauScheduler,
    train_loader: DataLoader,
    test_loader: DataLoader,
    paths: RunPaths,
    run_log: RunLog,
    visualizer: Visualizer,
    epoch: usize,
    last_completed: Option<usize>,
    metrics: TrainingMetrics,
}

impl Trainer {
    pub fn new(
        config: TrainConfig,
        model: Box<dyn InstanceSegmenter>,
        train_dataset: Arc<dyn SegmentationDataset>,
        test_dataset: Arc<dyn SegmentationDataset>,
        paths: RunPaths,
        categories: CategoryTable,
    ) -> Result<Self, MlError> {
        config.validate()?;
        let device = model.device().clone();
        let optimizer = AdamW::new(model.trainable_parameters()?, &config.optimizer)?;
        let scheduler = PlateauScheduler::new(&config.scheduler);
        let t = &config.training;
        let train_loader = DataLoader::new(
            train_dataset,
            t.batch_size,
            true,
            config.data.num_workers,
            t.seed,
            device.clone(),
        )?;
        let test_loader = DataLoader::new(
            test_dataset,
            t.batch_size,
            false,
            config.data.num_workers,
            t.seed,
            device.clone(),
        )?;
        let run_log = RunLog::new(&paths.log_file, config.output.verbose);
        let visualizer = Visualizer::new(&paths.images_dir, categories);

        let trainer = Self {
            fingerprint: config.fingerprint(),
            config,
            model,
            optimizer,
            scheduler,
            train_loader,
            test_loader,
            paths,
            run_log,
            visualizer,
            epoch: 0,
            last_completed: None,
            metrics: TrainingMetrics::default(),
        };
        trainer.log(format!("Trainer initialized. Device is [{device:?}]"));
        Ok(trainer)
    }

    /// Append to the run log, mirroring to the console when verbose.
    pub fn log(&self, message: impl AsRef<str>) {
        self.run_log.log(message);
    }

    /// The next epoch to train.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn model(&self) -> &dyn InstanceSegmenter {
        self.model.as_ref()
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &PlateauScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn model_file(&self) -> &Path {
        &self.paths.model_file
    }

    /// Restore model, optimizer and scheduler from the run's checkpoint.
    ///
    /// Returns `false`, changing nothing, when the file does not exist.
    pub fn load_checkpoint(&mut self) -> Result<bool, MlError> {
        let path = self.paths.model_file.clone();
        let Some(loaded) = load_checkpoint(&path, self.model.device())? else {
            self.log(format!(
                "Cannot load model file [{}] since it does not exist",
                path.display()
            ));
            return Ok(false);
        };
        loaded.check_fingerprint(&self.fingerprint);
        let saved_epoch = loaded.restore(
            self.model.as_ref(),
            &mut self.optimizer,
            &mut self.scheduler,
        )?;
        self.epoch = saved_epoch + 1;
        self.last_completed = Some(saved_epoch);
        if let Some(mut history) = load_json::<TrainingMetrics>(&self.paths.metrics_file)? {
            history.truncate(saved_epoch + 1);
            self.metrics = history;
        }
        self.log(format!("Loaded model file [{}]", path.display()));
        Ok(true)
    }

    /// Checkpoint when the current epoch is a multiple of `save_every`.
    pub fn save_if_due(&mut self) -> Result<bool, MlError> {
        if self.epoch % self.config.training.save_every != 0 {
            return Ok(false);
        }
        let completed = self
            .last_completed
            .unwrap_or_else(|| self.epoch.saturating_sub(1));
        save_checkpoint(
            &self.paths.model_file,
            self.model.as_ref(),
            &self.optimizer,
            &self.scheduler,
            completed,
            &self.fingerprint,
        )?;
        atomic_write_json(&self.paths.metrics_file, &self.metrics)?;
        self.log(format!(
            "Saved model to [{}]",
            self.paths.model_file.display()
        ));
        if let Some(report) = gpu_memory_report(self.model.device()) {
            self.log(report);
        }
        let stats = self.test_loader.dataset().stats();
        self.log(format!(
            "Test dataset: {} images, {} segments, {} loads, {} skipped segments",
            stats.images, stats.segments, stats.loads, stats.skipped_segments
        ));
        Ok(true)
    }

    /// Visualise and evaluate when the current epoch is a multiple of
    /// `eval_every`.
    pub fn evaluate_if_due(&mut self) -> Result<Option<EvalSummary>, MlError> {
        if self.epoch % self.config.training.eval_every != 0 {
            return Ok(None);
        }
        self.evaluate_now().map(Some)
    }

    /// Render the configured test image and score the whole test split.
    pub fn evaluate_now(&mut self) -> Result<EvalSummary, MlError> {
        self.visualize()?;
        let summary = evaluate(
            self.model.as_ref(),
            &self.test_loader,
            self.config.training.box_threshold,
        )?;
        for line in summary.to_string().lines() {
            self.log(line);
        }
        self.metrics.add_custom_metric("bbox_ap", summary.bbox.ap);
        self.metrics.add_custom_metric("segm_ap", summary.segm.ap);
        Ok(summary)
    }

    fn visualize(&self) -> Result<Option<PathBuf>, MlError> {
        let index = self.config.training.visualize_index;
        let dataset = self.test_loader.dataset();
        if index >= dataset.len() {
            tracing::warn!(
                index,
                len = dataset.len(),
                "visualize index outside the test split, skipping"
            );
            return Ok(None);
        }
        let sample = dataset.get(index)?;
        let batch = Batch::from_samples(vec![sample.clone()], vec![index], self.model.device())?;
        let detections = self
            .model
            .predict(&batch, self.config.training.box_threshold)?
            .into_iter()
            .next()
            .unwrap_or_default();
        let path = self
            .visualizer
            .render(&sample, &detections, self.epoch, index)?;
        self.log(format!(
            "Rendered {} detections to [{}]",
            detections.len(),
            path.display()
        ));
        Ok(Some(path))
    }

    /// Run `num_epochs` epochs from the current epoch.
    pub fn train(&mut self) -> Result<TrainingMetrics, MlError> {
        if self.train_loader.is_empty() {
            return Err(MlError::dataset(
                "train split is empty; raise data_limit or train_fraction",
            ));
        }
        let num_epochs = self.config.training.num_epochs;
        let settings = EpochSettings {
            accumulation_steps: self.config.training.gradient_accumulation_steps,
            print_freq: self.config.training.print_freq,
            warmup_first_epoch: self.config.training.warmup_first_epoch,
        };
        let started = Instant::now();

        for _ in 0..num_epochs {
            let outcome = train_one_epoch(
                self.model.as_ref(),
                &mut self.optimizer,
                &self.train_loader,
                self.epoch,
                &settings,
            )?;
            let mean_loss = outcome.mean_loss();

            let lr = self.optimizer.learning_rate();
            let next_lr = self.scheduler.step(mean_loss, lr);
            if next_lr != lr {
                self.optimizer.set_learning_rate(next_lr);
                self.log(format!("Learning rate reduced from {lr:e} to {next_lr:e}"));
            }
            self.metrics.record_epoch(self.epoch, mean_loss, next_lr);
            self.last_completed = Some(self.epoch);

            self.save_if_due()?;
            self.evaluate_if_due()?;

            self.log(format!("Epoch [{}/{}]", self.epoch + 1, num_epochs));
            self.epoch += 1;
        }

        self.log("Saving model one last time");
        self.save_if_due()?;
        self.evaluate_if_due()?;
        self.log("That's it!");

        self.metrics.total_training_time_secs += started.elapsed().as_secs_f64();
        Ok(self.metrics.clone())
    }
}
