//! Optimisation, scheduling, checkpoints and the epoch loop.

pub mod checkpoint;
pub mod engine;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointMeta, LoadedCheckpoint, load_checkpoint, save_checkpoint};
pub use engine::{EpochOutcome, EpochSettings, evaluate, train_one_epoch};
pub use metrics::{MetricLogger, SmoothedValue, TrainingMetrics};
pub use optimizer::{AdamW, GradientBuffer, OptimizerMeta, OptimizerState};
pub use scheduler::{PlateauScheduler, PlateauState, WarmupSchedule};
pub use trainer::Trainer;
