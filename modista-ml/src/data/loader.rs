//! Batching over a [`SegmentationDataset`].

use crate::data::dataset::{Sample, SegmentationDataset};
use crate::data::rle::Mask;
use crate::error::MlError;
use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::sync::Arc;

/// Ground truth for one image of a batch.
#[derive(Debug, Clone)]
pub struct Target {
    pub image_id: String,
    pub labels: Vec<u32>,
    pub boxes: Vec<[f32; 4]>,
    pub masks: Vec<Mask>,
}

/// Collated images plus per-image targets, in dataset order of `indices`.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, 3, D, D]` f32 in `[0, 1]`.
    pub images: Tensor,
    pub targets: Vec<Target>,
    pub indices: Vec<usize>,
    pub dim: u32,
}

impl Batch {
    pub fn from_samples(
        samples: Vec<Sample>,
        indices: Vec<usize>,
        device: &Device,
    ) -> Result<Self, MlError> {
        let Some(first) = samples.first() else {
            return Err(MlError::dataset("cannot collate an empty batch"));
        };
        let dim = first.dim;
        let d = dim as usize;
        let mut pixels = Vec::with_capacity(samples.len() * 3 * d * d);
        let mut targets = Vec::with_capacity(samples.len());
        for sample in samples {
            if sample.dim != dim {
                return Err(MlError::dataset(format!(
                    "image {} has dim {}, batch uses {dim}",
                    sample.image_id, sample.dim
                )));
            }
            pixels.extend_from_slice(&sample.image);
            targets.push(Target {
                image_id: sample.image_id,
                labels: sample.labels,
                boxes: sample.boxes,
                masks: sample.masks,
            });
        }
        let images = Tensor::from_vec(pixels, (targets.len(), 3, d, d), device)?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?;
        Ok(Self {
            images,
            targets,
            indices,
            dim,
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

pub struct DataLoader {
    dataset: Arc<dyn SegmentationDataset>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    pool: Option<rayon::ThreadPool>,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn SegmentationDataset>,
        batch_size: usize,
        shuffle: bool,
        num_workers: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self, MlError> {
        if batch_size == 0 {
            return Err(MlError::invalid_input("batch_size must be at least 1"));
        }
        let pool = if num_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|i| format!("modista-loader-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            seed,
            pool,
            device,
        })
    }

    pub fn dataset(&self) -> &Arc<dyn SegmentationDataset> {
        &self.dataset
    }

    /// Number of batches per epoch; the last partial batch is kept.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit order for `epoch`, reproducible from `seed + epoch`.
    pub fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    pub fn epoch_batches(&self, epoch: usize) -> EpochBatches<'_> {
        EpochBatches {
            loader: self,
            order: self.order(epoch),
            cursor: 0,
        }
    }

    fn load(&self, indices: &[usize]) -> Result<Vec<Sample>, MlError> {
        let dataset = &self.dataset;
        match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&i| dataset.get(i))
                    .collect::<Result<Vec<_>, _>>()
            }),
            None => indices.iter().map(|&i| dataset.get(i)).collect(),
        }
    }
}

pub struct EpochBatches<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<Batch, MlError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        Some(
            self.loader
                .load(&indices)
                .and_then(|samples| Batch::from_samples(samples, indices, &self.loader.device)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.cursor).div_ceil(self.loader.batch_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for EpochBatches<'_> {}
