//! Single-file training checkpoints.
//!
//! The checkpoint is a safetensors file holding `model.<name>` parameters and
//! `optimizer.m.<name>` / `optimizer.v.<name>` moments. The header metadata
//! key `modista` carries a JSON [`CheckpointMeta`] with the epoch, optimizer
//! hyper-parameters and scheduler counters.

use crate::error::MlError;
use crate::model::InstanceSegmenter;
use crate::training::optimizer::{AdamW, OptimizerMeta, OptimizerState};
use crate::training::scheduler::{PlateauScheduler, PlateauState};
use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const CHECKPOINT_VERSION: u32 = 1;
const META_KEY: &str = "modista";
const MODEL_PREFIX: &str = "model.";
const FIRST_MOMENT_PREFIX: &str = "optimizer.m.";
const SECOND_MOMENT_PREFIX: &str = "optimizer.v.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub version: u32,
    /// Last completed epoch.
    pub epoch: usize,
    pub optimizer: OptimizerMeta,
    pub scheduler: PlateauState,
    pub config_sha256: String,
    pub saved_at: DateTime<Utc>,
}

/// Persist model, optimizer and scheduler state for `epoch`.
///
/// The file is written next to `path` and renamed into place.
pub fn save_checkpoint(
    path: &Path,
    model: &dyn InstanceSegmenter,
    optimizer: &AdamW,
    scheduler: &PlateauScheduler,
    epoch: usize,
    config_sha256: &str,
) -> Result<CheckpointMeta, MlError> {
    let state = optimizer.state();
    let meta = CheckpointMeta {
        version: CHECKPOINT_VERSION,
        epoch,
        optimizer: state.meta.clone(),
        scheduler: scheduler.state().clone(),
        config_sha256: config_sha256.to_string(),
        saved_at: Utc::now(),
    };

    let mut tensors: Vec<(String, Tensor)> = Vec::new();
    for (name, var) in model.named_parameters()? {
        tensors.push((format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone()));
    }
    for (name, m) in &state.first_moments {
        tensors.push((format!("{FIRST_MOMENT_PREFIX}{name}"), m.clone()));
    }
    for (name, v) in &state.second_moments {
        tensors.push((format!("{SECOND_MOMENT_PREFIX}{name}"), v.clone()));
    }
    if tensors.is_empty() {
        return Err(MlError::checkpoint("model contains no parameters to checkpoint"));
    }

    let metadata = HashMap::from([(META_KEY.to_string(), serde_json::to_string(&meta)?)]);
    modista_core::persistence::atomic_write_with(path, |tmp| {
        safetensors::serialize_to_file(tensors, &Some(metadata), tmp)
            .map_err(std::io::Error::other)
    })?;
    tracing::debug!(path = %path.display(), epoch, "checkpoint written");
    Ok(meta)
}

/// A checkpoint read back from disk, not yet applied.
#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub meta: CheckpointMeta,
    model: HashMap<String, Tensor>,
    first_moments: HashMap<String, Tensor>,
    second_moments: HashMap<String, Tensor>,
}

/// Read the checkpoint at `path`; `Ok(None)` when it does not exist.
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<Option<LoadedCheckpoint>, MlError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let raw_meta = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(META_KEY))
        .ok_or_else(|| {
            MlError::checkpoint(format!("{} has no '{META_KEY}' metadata", path.display()))
        })?;
    let meta: CheckpointMeta = serde_json::from_str(raw_meta)?;
    if meta.version != CHECKPOINT_VERSION {
        return Err(MlError::checkpoint(format!(
            "{} has version {}, expected {CHECKPOINT_VERSION}",
            path.display(),
            meta.version
        )));
    }

    let mut model = HashMap::new();
    let mut first_moments = HashMap::new();
    let mut second_moments = HashMap::new();
    for (name, tensor) in candle_core::safetensors::load_buffer(&bytes, device)? {
        if let Some(rest) = name.strip_prefix(FIRST_MOMENT_PREFIX) {
            first_moments.insert(rest.to_string(), tensor);
        } else if let Some(rest) = name.strip_prefix(SECOND_MOMENT_PREFIX) {
            second_moments.insert(rest.to_string(), tensor);
        } else if let Some(rest) = name.strip_prefix(MODEL_PREFIX) {
            model.insert(rest.to_string(), tensor);
        } else {
            tracing::warn!(%name, "ignoring unknown checkpoint tensor");
        }
    }
    Ok(Some(LoadedCheckpoint {
        meta,
        model,
        first_moments,
        second_moments,
    }))
}

impl LoadedCheckpoint {
    /// Warn when the checkpoint was produced under a different configuration.
    pub fn check_fingerprint(&self, config_sha256: &str) -> bool {
        let same = self.meta.config_sha256 == config_sha256;
        if !same {
            tracing::warn!(
                saved = %self.meta.config_sha256,
                current = %config_sha256,
                "checkpoint was written with a different configuration"
            );
        }
        same
    }

    /// Copy the saved state into `model`, `optimizer` and `scheduler` and
    /// return the saved epoch.
    pub fn restore(
        mut self,
        model: &dyn InstanceSegmenter,
        optimizer: &mut AdamW,
        scheduler: &mut PlateauScheduler,
    ) -> Result<usize, MlError> {
        for (name, var) in model.named_parameters()? {
            let tensor = self.model.remove(&name).ok_or_else(|| {
                MlError::checkpoint(format!("checkpoint missing parameter {name}"))
            })?;
            let current = var.as_tensor();
            if tensor.dims() != current.dims() {
                return Err(MlError::checkpoint(format!(
                    "parameter {name} has shape {:?} in checkpoint, model expects {:?}",
                    tensor.dims(),
                    current.dims()
                )));
            }
            var.set(&tensor.to_dtype(current.dtype())?)?;
        }
        if !self.model.is_empty() {
            let mut extra: Vec<&String> = self.model.keys().collect();
            extra.sort();
            return Err(MlError::checkpoint(format!(
                "checkpoint contains unknown parameters: {}",
                extra.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }

        optimizer.load_state(OptimizerState {
            meta: self.meta.optimizer.clone(),
            first_moments: self.first_moments,
            second_moments: self.second_moments,
        })?;
        scheduler.load_state(self.meta.scheduler.clone());
        Ok(self.meta.epoch)
    }
}
