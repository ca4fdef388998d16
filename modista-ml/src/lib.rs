//! # modista-ml
//!
//! Dataset handling, the instance-segmentation model seam, and the training
//! loop for the Modista fashion segmentation trainer.

pub mod data;
pub mod device;
pub mod error;
pub mod eval;
pub mod model;
pub mod training;
pub mod visualize;

pub use data::{
    Batch, CategoryTable, DataLoader, ManifestDataset, PreparedDataset, ProcessedData, Sample,
    SegmentationDataset, process_data,
};
pub use device::{gpu_memory_report, seed_device, select_device};
pub use error::MlError;
pub use eval::{CocoEvaluator, EvalSummary};
pub use model::{DenseConfig, DenseSegmenter, Detection, InstanceSegmenter, LossDict};
pub use training::{Trainer, TrainingMetrics};
pub use visualize::Visualizer;
