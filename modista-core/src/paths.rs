//! File layout of a training run.
//!
//! Every artifact of a run is named after the model identifier
//! (`dim_<D>_images_<N>_classes_<C>`) so runs with different data limits or
//! class sets never overwrite each other's checkpoints.

use crate::config::TrainConfig;
use std::path::{Path, PathBuf};

/// Paths of everything a run writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub output_dir: PathBuf,
    pub identifier: String,
    /// Single checkpoint record, overwritten in place on each save.
    pub model_file: PathBuf,
    /// Per-run text log.
    pub log_file: PathBuf,
    /// JSON epoch history, rewritten with every checkpoint.
    pub metrics_file: PathBuf,
    /// Structured (JSON) tracing output for the whole process.
    pub trace_dir: PathBuf,
    pub images_dir: PathBuf,
    pub args_file: PathBuf,
}

impl RunPaths {
    pub fn new(output_dir: &Path, identifier: &str, suffix: Option<&str>) -> Self {
        let stem = match suffix {
            Some(s) if !s.is_empty() => format!("{identifier}_{s}"),
            _ => identifier.to_string(),
        };
        Self {
            output_dir: output_dir.to_path_buf(),
            identifier: identifier.to_string(),
            model_file: output_dir.join("Model").join(format!("{stem}.model")),
            log_file: output_dir.join("Log").join(format!("{stem}.log")),
            metrics_file: output_dir
                .join("Log")
                .join(format!("{stem}_metrics.json")),
            trace_dir: output_dir.join("Log"),
            images_dir: output_dir.join("Images"),
            args_file: output_dir.join("Args").join("args_text.yml"),
        }
    }

    /// Resolve the paths for `config` once the number of classes is known.
    pub fn for_run(config: &TrainConfig, num_classes: usize) -> Self {
        let identifier = model_identifier(config.data.target_dim, config.data.limit(), num_classes);
        let suffix = config.output.effective_suffix();
        Self::new(&config.output.dir, &identifier, Some(&suffix))
    }
}

/// `dim_<D>_images_<N|all>_classes_<C>`.
pub fn model_identifier(target_dim: u32, data_limit: Option<usize>, num_classes: usize) -> String {
    let images = data_limit
        .map(|n| n.to_string())
        .unwrap_or_else(|| "all".to_string());
    format!("dim_{target_dim}_images_{images}_classes_{num_classes}")
}
