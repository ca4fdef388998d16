//! Quantitative evaluation of detections against ground truth.

pub mod coco;

pub use coco::{ApStats, CocoEvaluator, EvalSummary};
