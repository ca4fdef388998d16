//! AdamW with decoupled weight decay and exportable state.

use crate::error::MlError;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use modista_core::config::OptimizerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const NORM_EPS: f64 = 1e-12;

/// Gradients summed across micro-batches, keyed by parameter name.
#[derive(Debug, Default)]
pub struct GradientBuffer {
    grads: HashMap<String, Tensor>,
    micro_batches: usize,
}

impl GradientBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the gradients of `params` found in `store`.
    pub fn accumulate(&mut self, store: &GradStore, params: &[(String, Var)]) -> Result<(), MlError> {
        for (name, var) in params {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            let summed = match self.grads.remove(name) {
                Some(prev) => (prev + grad)?,
                None => grad,
            };
            self.grads.insert(name.clone(), summed);
        }
        self.micro_batches += 1;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    /// Micro-batches accumulated since the last clear.
    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    pub fn is_empty(&self) -> bool {
        self.micro_batches == 0
    }

    pub fn clear(&mut self) {
        self.grads.clear();
        self.micro_batches = 0;
    }
}

/// Scalar optimizer state persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerMeta {
    pub step: usize,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

/// Full optimizer state: hyper-parameters plus both moments per parameter.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub meta: OptimizerMeta,
    pub first_moments: HashMap<String, Tensor>,
    pub second_moments: HashMap<String, Tensor>,
}

#[derive(Debug)]
struct Slot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

#[derive(Debug)]
pub struct AdamW {
    slots: Vec<Slot>,
    step: usize,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    clip_grad_norm: Option<f64>,
}

impl AdamW {
    pub fn new(params: Vec<(String, Var)>, config: &OptimizerConfig) -> Result<Self, MlError> {
        if params.is_empty() {
            return Err(MlError::training("optimizer requires at least one parameter"));
        }
        let mut slots = Vec::with_capacity(params.len());
        for (name, param) in params {
            let t = param.as_tensor();
            if !t.dtype().is_float() {
                return Err(MlError::training(format!(
                    "optimizer received non-floating parameter '{name}'"
                )));
            }
            slots.push(Slot {
                first_moment: Tensor::zeros(t.dims(), DType::F32, t.device())?,
                second_moment: Tensor::zeros(t.dims(), DType::F32, t.device())?,
                name,
                param,
            });
        }
        Ok(Self {
            slots,
            step: 0,
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
            clip_grad_norm: config.clip_grad_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Apply one update from the accumulated gradients.
    ///
    /// Returns `false` without touching any state when the buffer holds no
    /// gradient for any parameter.
    pub fn step(&mut self, grads: &GradientBuffer) -> Result<bool, MlError> {
        let mut present: Vec<(usize, Tensor)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| grads.get(&s.name).map(|g| (i, g.clone())))
            .collect();
        if present.is_empty() {
            return Ok(false);
        }

        if let Some(max_norm) = self.clip_grad_norm {
            let mut total_sq = 0.0;
            for (_, g) in &present {
                total_sq += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            }
            let total = total_sq.sqrt();
            if total > max_norm {
                let scale = max_norm / (total + NORM_EPS);
                for (_, g) in &mut present {
                    *g = g.affine(scale, 0.0)?;
                }
            }
        }

        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step as i32);

        for (index, grad) in present {
            let slot = &mut self.slots[index];
            let m = (slot.first_moment.affine(self.beta1, 0.0)? + grad.affine(1.0 - self.beta1, 0.0)?)?;
            let v = (slot.second_moment.affine(self.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?;

            let m_hat = m.affine(1.0 / bias1, 0.0)?;
            let denom = v.affine(1.0 / bias2, 0.0)?.sqrt()?.affine(1.0, self.eps)?;
            let update = (m_hat / denom)?.affine(self.lr, 0.0)?;

            let param = slot.param.as_tensor();
            let base = param.to_dtype(DType::F32)?;
            let decayed = if self.weight_decay != 0.0 {
                base.affine(1.0 - self.lr * self.weight_decay, 0.0)?
            } else {
                base
            };
            let next = (decayed - update)?.to_dtype(param.dtype())?;
            slot.param.set(&next)?;
            slot.first_moment = m;
            slot.second_moment = v;
        }
        Ok(true)
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            meta: OptimizerMeta {
                step: self.step,
                lr: self.lr,
                beta1: self.beta1,
                beta2: self.beta2,
                eps: self.eps,
                weight_decay: self.weight_decay,
            },
            first_moments: self
                .slots
                .iter()
                .map(|s| (s.name.clone(), s.first_moment.clone()))
                .collect(),
            second_moments: self
                .slots
                .iter()
                .map(|s| (s.name.clone(), s.second_moment.clone()))
                .collect(),
        }
    }

    /// Restore a saved state. Every parameter must be present with a
    /// matching shape.
    pub fn load_state(&mut self, mut state: OptimizerState) -> Result<(), MlError> {
        for slot in &mut self.slots {
            let dims = slot.param.as_tensor().dims().to_vec();
            let device = slot.param.as_tensor().device().clone();
            let take = |moments: &mut HashMap<String, Tensor>, kind: &str| {
                let t = moments.remove(&slot.name).ok_or_else(|| {
                    MlError::checkpoint(format!(
                        "optimizer state missing {kind} moment for '{}'",
                        slot.name
                    ))
                })?;
                if t.dims() != dims.as_slice() {
                    return Err(MlError::checkpoint(format!(
                        "optimizer {kind} moment for '{}' has shape {:?}, expected {dims:?}",
                        slot.name,
                        t.dims()
                    )));
                }
                Ok::<_, MlError>(t.to_dtype(DType::F32)?.to_device(&device)?)
            };
            let m = take(&mut state.first_moments, "first")?;
            let v = take(&mut state.second_moments, "second")?;
            slot.first_moment = m;
            slot.second_moment = v;
        }
        if !state.first_moments.is_empty() {
            tracing::warn!(
                extra = state.first_moments.len(),
                "optimizer state has moments for unknown parameters"
            );
        }
        let meta = state.meta;
        self.step = meta.step;
        self.lr = meta.lr;
        self.beta1 = meta.beta1;
        self.beta2 = meta.beta2;
        self.eps = meta.eps;
        self.weight_decay = meta.weight_decay;
        Ok(())
    }
}
