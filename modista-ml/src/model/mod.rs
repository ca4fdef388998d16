//! The model seam used by the trainer, and the bundled candle implementation.

pub mod dense;
pub mod postprocess;
pub mod targets;

pub use dense::{DenseConfig, DenseSegmenter};

use crate::data::loader::Batch;
use crate::data::rle::Mask;
use crate::error::MlError;
use candle_core::{Device, Tensor, Var};

/// Named scalar losses, in the order the model produced them.
#[derive(Debug, Clone, Default)]
pub struct LossDict {
    entries: Vec<(String, Tensor)>,
}

impl LossDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, loss: Tensor) {
        self.entries.push((name.into(), loss));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Sum of all losses; the tensor that gets back-propagated.
    pub fn total(&self) -> Result<Tensor, MlError> {
        let mut iter = self.entries.iter();
        let Some((_, first)) = iter.next() else {
            return Err(MlError::model("model returned no losses"));
        };
        let mut total = first.clone();
        for (_, loss) in iter {
            total = (total + loss)?;
        }
        Ok(total)
    }

    /// Host copies of every loss, for metric logging.
    pub fn values(&self) -> Result<Vec<(String, f64)>, MlError> {
        self.entries
            .iter()
            .map(|(name, t)| Ok((name.clone(), scalar(t)?)))
            .collect()
    }
}

pub(crate) fn scalar(t: &Tensor) -> Result<f64, MlError> {
    Ok(t.to_dtype(candle_core::DType::F64)?
        .flatten_all()?
        .sum_all()?
        .to_scalar::<f64>()?)
}

/// One predicted instance, in image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Class id + 1.
    pub label: u32,
    pub score: f32,
    pub bbox: [f32; 4],
    pub mask: Option<Mask>,
}

/// Everything the trainer needs from a detection/segmentation model.
pub trait InstanceSegmenter {
    /// Losses for `batch`. `train` selects training-mode layers.
    fn forward_losses(&self, batch: &Batch, train: bool) -> Result<LossDict, MlError>;

    /// Per-image detections scoring at least `box_threshold`.
    fn predict(&self, batch: &Batch, box_threshold: f32) -> Result<Vec<Vec<Detection>>, MlError>;

    /// Parameters handed to the optimizer.
    fn trainable_parameters(&self) -> Result<Vec<(String, Var)>, MlError>;

    /// Every persisted parameter, including frozen ones.
    fn named_parameters(&self) -> Result<Vec<(String, Var)>, MlError>;

    fn device(&self) -> &Device;
}
