//! Configuration system for Modista training runs.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is read from the file passed with `--config`, or from `modista.toml` in the
//! working directory when present.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Name of the config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "modista.toml";

/// Prefix for environment overrides (`MODISTA_TRAINING__BATCH_SIZE=4`).
pub const ENV_PREFIX: &str = "MODISTA_";

/// Top-level configuration for a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Dataset location, split and loading configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset root; annotations live under `<root>/Data`.
    #[serde(default = "default_data_root")]
    pub root: PathBuf,
    /// Maximum number of images to use. `0` means all images.
    #[serde(default = "default_data_limit")]
    pub data_limit: usize,
    /// Fraction of images (by first appearance) that form the train split.
    #[serde(default = "default_train_fraction")]
    pub train_fraction: f64,
    /// Side length images and masks are resized to. Must be divisible by 64.
    #[serde(default = "default_target_dim")]
    pub target_dim: u32,
    /// Read the prepared safetensors dataset instead of decoding CSV + JPEG.
    #[serde(default = "default_true")]
    pub prepared_dataset: bool,
    /// Directory holding the prepared dataset files (defaults to `root`).
    #[serde(default)]
    pub prepared_dir: Option<PathBuf>,
    /// Keep only these class ids, remapped to their position in the list.
    #[serde(default)]
    pub allowed_classes: Option<Vec<u32>>,
    /// Worker threads used to load the items of a batch.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Segments per image stored in a prepared dataset file.
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: default_data_root(),
            data_limit: default_data_limit(),
            train_fraction: default_train_fraction(),
            target_dim: default_target_dim(),
            prepared_dataset: true,
            prepared_dir: None,
            allowed_classes: None,
            num_workers: default_num_workers(),
            max_segments: default_max_segments(),
        }
    }
}

impl DataConfig {
    /// The image limit as an `Option`, `None` meaning "use everything".
    pub fn limit(&self) -> Option<usize> {
        (self.data_limit > 0).then_some(self.data_limit)
    }

    pub fn prepared_dir(&self) -> &Path {
        self.prepared_dir.as_deref().unwrap_or(&self.root)
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("..")
}

fn default_data_limit() -> usize {
    12_500
}

fn default_train_fraction() -> f64 {
    0.8
}

fn default_target_dim() -> u32 {
    512
}

fn default_num_workers() -> usize {
    4
}

fn default_max_segments() -> usize {
    64
}

/// Model construction options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Freeze batch-norm statistics and affine weights in the backbone.
    #[serde(default = "default_true")]
    pub freeze_batch_norm: bool,
    /// Optional safetensors file with `backbone.*` weights.
    #[serde(default)]
    pub pretrained_backbone: Option<PathBuf>,
    /// Channel width of the feature pyramid.
    #[serde(default = "default_fpn_channels")]
    pub fpn_channels: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            freeze_batch_norm: true,
            pretrained_backbone: None,
            fpn_channels: default_fpn_channels(),
        }
    }
}

fn default_fpn_channels() -> usize {
    64
}

/// AdamW hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Clip the global gradient norm to this value before each step.
    #[serde(default)]
    pub clip_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            clip_grad_norm: None,
        }
    }
}

fn default_lr() -> f64 {
    0.01
}

fn default_weight_decay() -> f64 {
    0.00005
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

/// Reduce-on-plateau scheduler settings (mode `min`, absolute threshold).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_sched_factor")]
    pub factor: f64,
    #[serde(default = "default_sched_patience")]
    pub patience: usize,
    #[serde(default = "default_sched_threshold")]
    pub threshold: f64,
    #[serde(default = "default_sched_min_lr")]
    pub min_lr: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub cooldown: usize,
    /// Log every learning-rate reduction.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            factor: default_sched_factor(),
            patience: default_sched_patience(),
            threshold: default_sched_threshold(),
            min_lr: default_sched_min_lr(),
            eps: default_eps(),
            cooldown: 0,
            verbose: false,
        }
    }
}

fn default_sched_factor() -> f64 {
    0.01
}

fn default_sched_patience() -> usize {
    1
}

fn default_sched_threshold() -> f64 {
    0.0001
}

fn default_sched_min_lr() -> f64 {
    1e-8
}

/// Epoch loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    /// Micro-batches whose gradients are summed before one optimizer step.
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation_steps: usize,
    /// Save a checkpoint on every epoch divisible by this value.
    #[serde(default = "default_save_every")]
    pub save_every: usize,
    /// Evaluate and visualise on every epoch divisible by this value.
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    /// Detections scoring below this are ignored.
    #[serde(default = "default_box_threshold")]
    pub box_threshold: f32,
    /// Iterations between progress lines.
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,
    /// Linearly warm the learning rate up during the first epoch.
    #[serde(default = "default_true")]
    pub warmup_first_epoch: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Resume from the run's checkpoint; a missing file is fatal.
    #[serde(default = "default_true")]
    pub load_model: bool,
    /// Run the epoch loop after setup.
    #[serde(default = "default_true")]
    pub train: bool,
    /// Test-split index rendered by the visualiser.
    #[serde(default = "default_visualize_index")]
    pub visualize_index: usize,
    /// Ignore CUDA even if it is available.
    #[serde(default)]
    pub force_cpu: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_epochs: default_num_epochs(),
            gradient_accumulation_steps: default_accumulation(),
            save_every: default_save_every(),
            eval_every: default_eval_every(),
            box_threshold: default_box_threshold(),
            print_freq: default_print_freq(),
            warmup_first_epoch: true,
            seed: default_seed(),
            load_model: true,
            train: true,
            visualize_index: default_visualize_index(),
            force_cpu: false,
        }
    }
}

fn default_batch_size() -> usize {
    12
}

fn default_num_epochs() -> usize {
    4
}

fn default_accumulation() -> usize {
    2
}

fn default_save_every() -> usize {
    5
}

fn default_eval_every() -> usize {
    10
}

fn default_box_threshold() -> f32 {
    0.3
}

fn default_print_freq() -> usize {
    100
}

fn default_seed() -> u64 {
    1
}

fn default_visualize_index() -> usize {
    1
}

/// Where checkpoints, logs and images are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_model_file_suffix")]
    pub model_file_suffix: String,
    /// Prefix the suffix with the current user name.
    #[serde(default = "default_true")]
    pub add_user_name_to_model_file: bool,
    /// Mirror run-log lines to the tracing output.
    #[serde(default = "default_true")]
    pub verbose: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            model_file_suffix: default_model_file_suffix(),
            add_user_name_to_model_file: true,
            verbose: true,
        }
    }
}

impl OutputConfig {
    /// Suffix used for the checkpoint and run-log file names.
    pub fn effective_suffix(&self) -> String {
        if self.add_user_name_to_model_file {
            let user = current_user();
            if self.model_file_suffix.is_empty() {
                user
            } else {
                format!("{user}_{}", self.model_file_suffix)
            }
        } else {
            self.model_file_suffix.clone()
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("Code")
}

fn default_model_file_suffix() -> String {
    "effdet_h5py_rpn".to_string()
}

fn default_true() -> bool {
    true
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "user".to_string())
}

impl TrainConfig {
    /// Reject settings the trainer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.training;
        if t.batch_size == 0 {
            return Err(ConfigError::invalid("training.batch_size must be at least 1"));
        }
        if t.gradient_accumulation_steps == 0 {
            return Err(ConfigError::invalid(
                "training.gradient_accumulation_steps must be at least 1",
            ));
        }
        if t.save_every == 0 || t.eval_every == 0 {
            return Err(ConfigError::invalid(
                "training.save_every and training.eval_every must be at least 1",
            ));
        }
        if t.print_freq == 0 {
            return Err(ConfigError::invalid("training.print_freq must be at least 1"));
        }
        if !(0.0..=1.0).contains(&t.box_threshold) {
            return Err(ConfigError::invalid(
                "training.box_threshold must be within [0, 1]",
            ));
        }

        let d = &self.data;
        if d.target_dim == 0 || d.target_dim % 64 != 0 {
            return Err(ConfigError::invalid(format!(
                "data.target_dim must be a positive multiple of 64 (got {})",
                d.target_dim
            )));
        }
        if !(d.train_fraction > 0.0 && d.train_fraction < 1.0) {
            return Err(ConfigError::invalid(
                "data.train_fraction must be within (0, 1)",
            ));
        }
        if d.max_segments == 0 {
            return Err(ConfigError::invalid("data.max_segments must be at least 1"));
        }
        if matches!(&d.allowed_classes, Some(classes) if classes.is_empty()) {
            return Err(ConfigError::invalid(
                "data.allowed_classes must not be empty when set",
            ));
        }

        let o = &self.optimizer;
        if !(o.lr > 0.0) {
            return Err(ConfigError::invalid("optimizer.lr must be positive"));
        }
        if o.weight_decay < 0.0 {
            return Err(ConfigError::invalid(
                "optimizer.weight_decay must not be negative",
            ));
        }
        if !(0.0..1.0).contains(&o.beta1) || !(0.0..1.0).contains(&o.beta2) {
            return Err(ConfigError::invalid("optimizer betas must be within [0, 1)"));
        }
        if matches!(o.clip_grad_norm, Some(norm) if norm <= 0.0) {
            return Err(ConfigError::invalid(
                "optimizer.clip_grad_norm must be positive when set",
            ));
        }

        let s = &self.scheduler;
        if !(s.factor > 0.0 && s.factor < 1.0) {
            return Err(ConfigError::invalid("scheduler.factor must be within (0, 1)"));
        }
        if s.min_lr < 0.0 || s.threshold < 0.0 || s.eps < 0.0 {
            return Err(ConfigError::invalid(
                "scheduler.min_lr, scheduler.threshold and scheduler.eps must not be negative",
            ));
        }

        if self.model.fpn_channels == 0 {
            return Err(ConfigError::invalid("model.fpn_channels must be at least 1"));
        }
        Ok(())
    }

    /// SHA-256 over the JSON form of the config, stored in checkpoints.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(json))
    }

    /// YAML dump of the resolved config, written next to the run outputs.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (usually the CLI flags that were set)
/// 2. Environment variables (prefixed with `MODISTA_`, sections split on `__`)
/// 3. The config file (`config_file`, or `./modista.toml` when it exists)
/// 4. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&serde_json::Value>,
) -> Result<TrainConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));

    match config_file {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            let local = Path::new(DEFAULT_CONFIG_FILE);
            if local.exists() {
                figment = figment.merge(Toml::file(local));
            }
        }
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::Extract(Box::new(e)))
}
