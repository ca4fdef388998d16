//! Trainer orchestration driven by a one-parameter model.

use candle_core::{Device, Tensor, Var};
use modista_core::{RunPaths, TrainConfig};
use modista_ml::data::{InMemoryDataset, Mask, Sample};
use modista_ml::model::{Detection, InstanceSegmenter, LossDict};
use modista_ml::training::{AdamW, EpochSettings, train_one_epoch};
use modista_ml::{Batch, CategoryTable, DataLoader, MlError, SegmentationDataset, Trainer};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Quadratic bowl around `target`; optionally produces a NaN loss.
struct Toy {
    w: Var,
    target: f32,
    poisoned: bool,
    device: Device,
}

impl Toy {
    fn new(init: f32) -> Self {
        let device = Device::Cpu;
        Self {
            w: Var::new(&[init], &device).unwrap(),
            target: 1.0,
            poisoned: false,
            device,
        }
    }

    fn value(&self) -> f32 {
        self.w.as_tensor().to_vec1::<f32>().unwrap()[0]
    }
}

impl InstanceSegmenter for Toy {
    fn forward_losses(&self, batch: &Batch, _train: bool) -> Result<LossDict, MlError> {
        let diff = self.w.as_tensor().affine(1.0, -(self.target as f64))?;
        let mut loss = diff.sqr()?.sum_all()?.affine(batch.len() as f64, 0.0)?;
        if self.poisoned {
            loss = (loss + Tensor::new(f32::NAN, &self.device)?)?;
        }
        let mut losses = LossDict::new();
        losses.insert("loss_quadratic", loss);
        Ok(losses)
    }

    fn predict(&self, batch: &Batch, _box_threshold: f32) -> Result<Vec<Vec<Detection>>, MlError> {
        Ok(batch
            .targets
            .iter()
            .map(|t| {
                t.labels
                    .iter()
                    .zip(&t.boxes)
                    .map(|(&label, &bbox)| Detection {
                        label,
                        score: 0.9,
                        bbox,
                        mask: None,
                    })
                    .collect()
            })
            .collect())
    }

    fn trainable_parameters(&self) -> Result<Vec<(String, Var)>, MlError> {
        Ok(vec![("w".to_string(), self.w.clone())])
    }

    fn named_parameters(&self) -> Result<Vec<(String, Var)>, MlError> {
        self.trainable_parameters()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn samples(n: usize) -> Arc<dyn SegmentationDataset> {
    let dim = 8;
    let items = (0..n)
        .map(|i| {
            let mut mask = Mask::zeros(dim, dim);
            mask.set(1, 1, true);
            Sample {
                image_id: format!("img{i}"),
                dim,
                image: vec![(i * 10) as u8; 3 * 64],
                labels: vec![1],
                boxes: vec![[1.0, 1.0, 2.0, 2.0]],
                masks: vec![mask],
            }
        })
        .collect();
    Arc::new(InMemoryDataset::new(items))
}

fn config(num_epochs: usize, save_every: usize, eval_every: usize) -> TrainConfig {
    let mut config = TrainConfig::default();
    config.data.num_workers = 0;
    config.training.batch_size = 2;
    config.training.num_epochs = num_epochs;
    config.training.save_every = save_every;
    config.training.eval_every = eval_every;
    config.training.gradient_accumulation_steps = 2;
    config.training.warmup_first_epoch = false;
    config.optimizer.lr = 0.05;
    config.output.verbose = false;
    config
}

fn trainer(dir: &Path, config: TrainConfig, model: Toy) -> Trainer {
    trainer_on(dir, config, model, samples(6))
}

fn trainer_on(
    dir: &Path,
    config: TrainConfig,
    model: Toy,
    train: Arc<dyn SegmentationDataset>,
) -> Trainer {
    let paths = RunPaths::new(dir, "dim_8_images_all_classes_1", Some("test"));
    Trainer::new(
        config,
        Box::new(model),
        train,
        samples(3),
        paths,
        CategoryTable::default(),
    )
    .unwrap()
}

fn run_log(dir: &Path) -> String {
    std::fs::read_to_string(
        dir.join("Log")
            .join("dim_8_images_all_classes_1_test.log"),
    )
    .unwrap()
}

#[test]
fn missing_checkpoint_reports_false_and_keeps_state() {
    let dir = TempDir::new().unwrap();
    let mut t = trainer(dir.path(), config(1, 1, 1), Toy::new(3.0));
    assert!(!t.load_checkpoint().unwrap());
    assert_eq!(t.epoch(), 0);
    assert_eq!(t.optimizer().steps(), 0);
    assert!(run_log(dir.path()).contains("since it does not exist"));
}

#[test]
fn resume_restores_epoch_parameters_and_optimizer() {
    let dir = TempDir::new().unwrap();
    let mut first = trainer(dir.path(), config(2, 1, 100), Toy::new(3.0));
    let metrics = first.train().unwrap();
    assert_eq!(metrics.epochs_completed, 2);
    assert_eq!(first.epoch(), 2);
    let trained_w = first.model().named_parameters().unwrap()[0]
        .1
        .as_tensor()
        .to_vec1::<f32>()
        .unwrap();
    assert!(trained_w[0] < 3.0);

    let fresh = Toy::new(-7.0);
    let mut second = trainer(dir.path(), config(2, 1, 100), fresh);
    assert!(second.load_checkpoint().unwrap());
    // The last save recorded epoch 1, so training resumes at 2.
    assert_eq!(second.epoch(), 2);
    let restored_w = second.model().named_parameters().unwrap()[0]
        .1
        .as_tensor()
        .to_vec1::<f32>()
        .unwrap();
    assert_eq!(restored_w, trained_w);
    assert_eq!(second.optimizer().steps(), first.optimizer().steps());
    assert_eq!(second.scheduler().state(), first.scheduler().state());
    let (a, b) = (&first.metrics().loss_history, &second.metrics().loss_history);
    assert_eq!(a.len(), b.len());
    assert!(a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-12));
    assert_eq!(second.metrics().epochs_completed, 2);
}

#[test]
fn resume_keeps_history_in_step_with_checkpoint() {
    let dir = TempDir::new().unwrap();
    // Default intervals: only epoch 0 is checkpointed in a 4-epoch run.
    let mut first = trainer(dir.path(), config(4, 5, 100), Toy::new(3.0));
    assert_eq!(first.train().unwrap().loss_history.len(), 4);

    let mut second = trainer(dir.path(), config(4, 5, 100), Toy::new(3.0));
    assert!(second.load_checkpoint().unwrap());
    assert_eq!(second.epoch(), 1);
    assert_eq!(second.metrics().loss_history.len(), second.epoch());
    assert_eq!(second.metrics().epochs_completed, 1);
    assert_eq!(second.metrics().best_epoch, Some(0));
}

#[test]
fn stale_history_is_trimmed_on_load() {
    let dir = TempDir::new().unwrap();
    let mut first = trainer(dir.path(), config(1, 1, 100), Toy::new(3.0));
    first.train().unwrap();

    // A history running ahead of the checkpoint, as left by an older run.
    let mut stale = first.metrics().clone();
    stale.record_epoch(1, 0.25, 0.05);
    stale.record_epoch(2, 0.125, 0.05);
    let metrics_file = dir
        .path()
        .join("Log")
        .join("dim_8_images_all_classes_1_test_metrics.json");
    std::fs::write(&metrics_file, serde_json::to_string(&stale).unwrap()).unwrap();

    let mut second = trainer(dir.path(), config(1, 1, 100), Toy::new(3.0));
    assert!(second.load_checkpoint().unwrap());
    assert_eq!(second.epoch(), 1);
    let (a, b) = (&first.metrics().loss_history, &second.metrics().loss_history);
    assert_eq!(b.len(), 1);
    assert!((a[0] - b[0]).abs() < 1e-12);
    assert_eq!(second.metrics().epochs_completed, 1);
}

#[test]
fn empty_train_split_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut t = trainer_on(dir.path(), config(3, 1, 1), Toy::new(3.0), samples(0));
    let err = t.train().unwrap_err();
    assert!(matches!(err, MlError::Dataset(_)));
    assert!(t.metrics().loss_history.is_empty());
    assert!(!dir.path().join("Model").exists());
}

#[test]
fn save_and_eval_fire_on_interval_epochs() {
    let dir = TempDir::new().unwrap();
    let mut t = trainer(dir.path(), config(3, 2, 3), Toy::new(3.0));
    t.train().unwrap();
    let log = run_log(dir.path());

    // Saves at epochs 0 and 2; the post-loop call at epoch 3 is skipped.
    assert_eq!(log.matches("Saved model to").count(), 2);
    // Evaluations at epoch 0 and at the post-loop epoch 3.
    assert_eq!(log.matches("IoU metric: bbox").count(), 2);
    assert!(dir.path().join("Images").join("epoch_0_img_1.png").exists());
    assert!(dir.path().join("Images").join("epoch_3_img_1.png").exists());
    assert!(!dir.path().join("Images").join("epoch_1_img_1.png").exists());

    let epochs: Vec<&str> = log
        .lines()
        .filter_map(|l| l.split("] ").nth(1))
        .filter(|m| m.starts_with("Epoch ["))
        .collect();
    assert_eq!(epochs, vec!["Epoch [1/3]", "Epoch [2/3]", "Epoch [3/3]"]);
    assert!(log.contains("Saving model one last time"));
    assert!(log.trim_end().ends_with("That's it!"));
}

#[test]
fn perfect_predictions_evaluate_to_full_ap() {
    let dir = TempDir::new().unwrap();
    let mut t = trainer(dir.path(), config(1, 1, 1), Toy::new(3.0));
    let summary = t.evaluate_now().unwrap();
    assert_eq!(summary.images, 3);
    assert!((summary.bbox.ap - 1.0).abs() < 1e-9);
}

#[test]
fn accumulation_steps_once_per_window_plus_remainder() {
    let model = Toy::new(3.0);
    let mut optimizer = AdamW::new(
        model.trainable_parameters().unwrap(),
        &config(1, 1, 1).optimizer,
    )
    .unwrap();
    // 5 samples at batch size 1 is 5 batches.
    let loader = DataLoader::new(samples(5), 1, true, 0, 1, Device::Cpu).unwrap();
    let settings = EpochSettings {
        accumulation_steps: 2,
        print_freq: 100,
        warmup_first_epoch: true,
    };
    let outcome = train_one_epoch(&model, &mut optimizer, &loader, 0, &settings).unwrap();
    assert_eq!(outcome.batches, 5);
    assert_eq!(outcome.optimizer_steps, 3);
    assert_eq!(optimizer.steps(), 3);
    // Warm-up restores the base rate at the end of epoch 0.
    assert_eq!(optimizer.learning_rate(), 0.05);
    assert!(outcome.mean_loss().is_finite());
    assert!(model.value() < 3.0);
}

#[test]
fn non_finite_loss_aborts_training() {
    let dir = TempDir::new().unwrap();
    let mut toy = Toy::new(3.0);
    toy.poisoned = true;
    let mut t = trainer(dir.path(), config(1, 1, 1), toy);
    let err = t.train().unwrap_err();
    assert!(matches!(err, MlError::Training(_)));
    assert!(!dir.path().join("Model").exists());
}

#[test]
fn plateau_reduces_rate_between_epochs() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(4, 100, 100);
    cfg.scheduler.patience = 0;
    cfg.scheduler.factor = 0.5;
    // Start at the optimum so the loss can never improve by the threshold.
    let mut toy = Toy::new(1.0);
    toy.target = 1.0;
    cfg.optimizer.lr = 1e-3;
    let mut t = trainer(dir.path(), cfg, toy);
    let metrics = t.train().unwrap();
    assert_eq!(metrics.lr_history.len(), 4);
    assert_eq!(metrics.lr_history[0], 1e-3);
    assert!(metrics.lr_history[1] < metrics.lr_history[0]);
    assert!(metrics.lr_history.windows(2).all(|w| w[1] <= w[0]));
}
