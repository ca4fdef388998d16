//! Annotation manifests, masks, datasets and batching.

pub mod annotations;
pub mod dataset;
pub mod loader;
pub mod prepared;
pub mod rle;

pub use annotations::{CategoryTable, ProcessedData, SegmentRecord, process_data};
pub use dataset::{DatasetStats, InMemoryDataset, ManifestDataset, Sample, SegmentationDataset};
pub use loader::{Batch, DataLoader, Target};
pub use prepared::{PreparedDataset, prepared_file_name, write_prepared};
pub use rle::Mask;
