//! End-to-end run of the dense segmenter on a tiny synthetic split.

use candle_core::Device;
use modista_core::{RunPaths, TrainConfig};
use modista_ml::data::{InMemoryDataset, Mask, Sample};
use modista_ml::{
    CategoryTable, DenseConfig, DenseSegmenter, InstanceSegmenter, SegmentationDataset, Trainer,
};
use std::sync::Arc;
use tempfile::TempDir;

const DIM: u32 = 64;

/// Bright square on a dark background, labelled 1 or 2 by position.
fn square(i: usize) -> Sample {
    let (x0, y0, side) = if i % 2 == 0 { (8, 8, 24) } else { (30, 28, 20) };
    let mut mask = Mask::zeros(DIM, DIM);
    let mut image = vec![20u8; 3 * (DIM * DIM) as usize];
    for y in y0..y0 + side {
        for x in x0..x0 + side {
            mask.set(x, y, true);
            let p = (y * DIM + x) as usize;
            image[p] = 220;
            image[(DIM * DIM) as usize + p] = if i % 2 == 0 { 40 } else { 200 };
        }
    }
    Sample {
        image_id: format!("sq{i}"),
        dim: DIM,
        image,
        labels: vec![1 + (i % 2) as u32],
        boxes: vec![[
            x0 as f32,
            y0 as f32,
            (x0 + side) as f32,
            (y0 + side) as f32,
        ]],
        masks: vec![mask],
    }
}

fn split(n: usize) -> Arc<dyn SegmentationDataset> {
    Arc::new(InMemoryDataset::new((0..n).map(square).collect()))
}

fn model() -> DenseSegmenter {
    DenseSegmenter::new(
        DenseConfig {
            num_labels: 3,
            fpn_channels: 16,
            freeze_batch_norm: false,
        },
        &Device::Cpu,
    )
    .unwrap()
}

fn config() -> TrainConfig {
    let mut config = TrainConfig::default();
    config.data.target_dim = DIM;
    config.data.num_workers = 0;
    config.training.batch_size = 2;
    config.training.num_epochs = 2;
    config.training.save_every = 1;
    config.training.eval_every = 2;
    config.training.print_freq = 1;
    config.optimizer.lr = 1e-3;
    config.model.fpn_channels = 16;
    config.output.verbose = false;
    config
}

#[test]
fn dense_model_trains_saves_and_resumes() {
    let dir = TempDir::new().unwrap();
    let paths = RunPaths::new(dir.path(), "dim_64_images_all_classes_2", None);
    let mut trainer = Trainer::new(
        config(),
        Box::new(model()),
        split(4),
        split(2),
        paths.clone(),
        CategoryTable::default(),
    )
    .unwrap();
    let metrics = trainer.train().unwrap();
    assert_eq!(metrics.epochs_completed, 2);
    assert!(metrics.loss_history.iter().all(|l| l.is_finite()));
    assert!(paths.model_file.exists());
    assert!(dir.path().join("Images").join("epoch_0_img_1.png").exists());
    // 4 images at batch size 2 with accumulation 2: one step per epoch.
    assert_eq!(trainer.optimizer().steps(), 2);

    let trained = trainer.model().named_parameters().unwrap();
    let mut resumed = Trainer::new(
        config(),
        Box::new(model()),
        split(4),
        split(2),
        paths,
        CategoryTable::default(),
    )
    .unwrap();
    assert!(resumed.load_checkpoint().unwrap());
    assert_eq!(resumed.epoch(), 2);
    let restored = resumed.model().named_parameters().unwrap();
    assert_eq!(trained.len(), restored.len());
    for ((name_a, a), (name_b, b)) in trained.iter().zip(&restored) {
        assert_eq!(name_a, name_b);
        let a: Vec<f32> = a.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b, "{name_a} differs after resume");
    }
}
