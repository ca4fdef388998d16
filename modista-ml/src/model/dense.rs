//! Single-stage dense instance segmenter built with candle-nn.
//!
//! A strided conv + batch-norm backbone produces stride-8 and stride-16
//! features, a small top-down pyramid merges them, and three heads run on the
//! stride-8 map: per-cell class logits, per-cell `(l, t, r, b)` box distances
//! and per-pixel semantic mask logits. Instances are read off the class map,
//! de-duplicated with NMS and given the box crop of their class mask.

use crate::data::loader::Batch;
use crate::data::rle::Mask;
use crate::error::MlError;
use crate::model::postprocess::{MAX_DETECTIONS, NMS_IOU, nms};
use crate::model::targets::{DenseTargets, assign};
use crate::model::{Detection, InstanceSegmenter, LossDict};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{
    BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder, VarMap,
};
use std::path::Path;

pub const STRIDE: u32 = 8;
const SMOOTH_L1_BETA: f64 = 1.0 / 9.0;
const MASK_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct DenseConfig {
    /// Number of classes plus one for background.
    pub num_labels: usize,
    pub fpn_channels: usize,
    pub freeze_batch_norm: bool,
}

struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn new(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Self, MlError> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv2d_no_bias(in_c, out_c, 3, cfg, vb.pp("conv"))?,
            bn: candle_nn::batch_norm(out_c, BatchNormConfig::default(), vb.pp("bn"))?,
        })
    }

    fn forward(&self, x: &Tensor, train_bn: bool) -> Result<Tensor, MlError> {
        let x = self.conv.forward(x)?;
        Ok(self.bn.forward_t(&x, train_bn)?.relu()?)
    }
}

pub struct DenseSegmenter {
    config: DenseConfig,
    varmap: VarMap,
    device: Device,
    stem: ConvBn,
    layer2: ConvBn,
    layer3: ConvBn,
    layer4: ConvBn,
    lateral3: Conv2d,
    lateral4: Conv2d,
    smooth: Conv2d,
    cls_head: Conv2d,
    box_head: Conv2d,
    mask_head: Conv2d,
}

impl std::fmt::Debug for DenseSegmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenseSegmenter")
            .field("config", &self.config)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl DenseSegmenter {
    pub fn new(config: DenseConfig, device: &Device) -> Result<Self, MlError> {
        if config.num_labels < 2 {
            return Err(MlError::model(format!(
                "need at least one class besides background, got {} labels",
                config.num_labels
            )));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let f = config.fpn_channels;
        let k = config.num_labels;
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let backbone = vb.pp("backbone");
        let stem = ConvBn::new(3, 16, 2, backbone.pp("stem"))?;
        let layer2 = ConvBn::new(16, 32, 2, backbone.pp("layer2"))?;
        let layer3 = ConvBn::new(32, 64, 2, backbone.pp("layer3"))?;
        let layer4 = ConvBn::new(64, 128, 2, backbone.pp("layer4"))?;

        let fpn = vb.pp("fpn");
        let lateral3 = candle_nn::conv2d(64, f, 1, Default::default(), fpn.pp("lateral3"))?;
        let lateral4 = candle_nn::conv2d(128, f, 1, Default::default(), fpn.pp("lateral4"))?;
        let smooth = candle_nn::conv2d(f, f, 3, same, fpn.pp("smooth"))?;

        let heads = vb.pp("heads");
        let cls_head = candle_nn::conv2d(f, k, 3, same, heads.pp("cls"))?;
        let box_head = candle_nn::conv2d(f, 4, 3, same, heads.pp("box"))?;
        let mask_head = candle_nn::conv2d(f, k, 3, same, heads.pp("mask"))?;

        tracing::debug!(num_labels = k, fpn_channels = f, "built dense segmenter");
        Ok(Self {
            config,
            varmap,
            device: device.clone(),
            stem,
            layer2,
            layer3,
            layer4,
            lateral3,
            lateral4,
            smooth,
            cls_head,
            box_head,
            mask_head,
        })
    }

    pub fn config(&self) -> &DenseConfig {
        &self.config
    }

    /// Copy `backbone.*` tensors from a safetensors file into the model.
    /// Returns the number of tensors loaded.
    pub fn load_backbone(&self, path: &Path) -> Result<usize, MlError> {
        let tensors = candle_core::safetensors::load(path, &self.device)?;
        let mut loaded = 0;
        for (name, var) in self.named_parameters()? {
            if !name.starts_with("backbone.") {
                continue;
            }
            let Some(tensor) = tensors.get(&name) else {
                tracing::warn!(%name, "pretrained backbone is missing a tensor");
                continue;
            };
            if tensor.dims() != var.as_tensor().dims() {
                return Err(MlError::model(format!(
                    "pretrained tensor {name} has shape {:?}, model expects {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                )));
            }
            var.set(&tensor.to_dtype(var.as_tensor().dtype())?)?;
            loaded += 1;
        }
        tracing::info!(path = %path.display(), loaded, "loaded pretrained backbone");
        Ok(loaded)
    }

    fn features(&self, images: &Tensor, train: bool) -> Result<Tensor, MlError> {
        let bn_train = train && !self.config.freeze_batch_norm;
        let x = images.affine(2.0, -1.0)?;
        let x = self.stem.forward(&x, bn_train)?;
        let x = self.layer2.forward(&x, bn_train)?;
        let c3 = self.layer3.forward(&x, bn_train)?;
        let c4 = self.layer4.forward(&c3, bn_train)?;

        let (_, _, h, w) = c3.dims4()?;
        let top = self.lateral4.forward(&c4)?.upsample_nearest2d(h, w)?;
        let p3 = (self.lateral3.forward(&c3)? + top)?;
        Ok(self.smooth.forward(&p3)?.relu()?)
    }
}

/// `[B, C, H, W]` to `[B*H*W, C]`.
fn cells_last(t: &Tensor) -> Result<Tensor, MlError> {
    let (b, c, h, w) = t.dims4()?;
    Ok(t.permute((0, 2, 3, 1))?.contiguous()?.reshape((b * h * w, c))?)
}

impl InstanceSegmenter for DenseSegmenter {
    fn forward_losses(&self, batch: &Batch, train: bool) -> Result<LossDict, MlError> {
        let feats = self.features(&batch.images, train)?;
        let (_, _, h, _) = feats.dims4()?;
        let targets: Vec<DenseTargets> = batch
            .targets
            .iter()
            .map(|t| assign(t, batch.dim, STRIDE))
            .collect();
        if targets.iter().any(|t| t.grid != h) {
            return Err(MlError::model(format!(
                "feature grid {h} does not match target grid for dim {}",
                batch.dim
            )));
        }

        let n: usize = targets.iter().map(|t| t.classes.len()).sum();
        let classes: Vec<u32> = targets.iter().flat_map(|t| t.classes.iter().copied()).collect();
        let semantic: Vec<u32> = targets.iter().flat_map(|t| t.semantic.iter().copied()).collect();
        let boxes: Vec<f32> = targets.iter().flat_map(|t| t.boxes.iter().flatten().copied()).collect();
        let positive: Vec<f32> = targets.iter().flat_map(|t| t.positive.iter().copied()).collect();
        let num_pos = targets.iter().map(DenseTargets::num_positive).sum::<usize>().max(1);

        let device = feats.device();
        let mut losses = LossDict::new();

        let cls_logits = cells_last(&self.cls_head.forward(&feats)?)?;
        let cls_target = Tensor::from_vec(classes, n, device)?;
        losses.insert(
            "loss_classifier",
            candle_nn::loss::cross_entropy(&cls_logits, &cls_target)?,
        );

        let box_pred = cells_last(&candle_nn::ops::sigmoid(&self.box_head.forward(&feats)?)?)?;
        let box_target = Tensor::from_vec(boxes, (n, 4), device)?;
        let pos = Tensor::from_vec(positive, (n, 1), device)?;
        let diff = (box_pred - box_target)?.abs()?;
        // min(diff, beta) without a scalar-tensor op.
        let clipped = ((diff.affine(1.0, SMOOTH_L1_BETA)? - diff.affine(1.0, -SMOOTH_L1_BETA)?.abs()?)?
            .affine(0.5, 0.0))?;
        let smooth_l1 = (clipped.sqr()?.affine(0.5 / SMOOTH_L1_BETA, 0.0)? + (&diff - &clipped)?)?;
        let loss_box = smooth_l1
            .broadcast_mul(&pos)?
            .sum_all()?
            .affine(1.0 / num_pos as f64, 0.0)?;
        losses.insert("loss_box_reg", loss_box);

        let mask_logits = cells_last(&self.mask_head.forward(&feats)?)?;
        let mask_target = Tensor::from_vec(semantic, n, device)?;
        losses.insert(
            "loss_mask",
            candle_nn::loss::cross_entropy(&mask_logits, &mask_target)?,
        );
        Ok(losses)
    }

    fn predict(&self, batch: &Batch, box_threshold: f32) -> Result<Vec<Vec<Detection>>, MlError> {
        let feats = self.features(&batch.images, false)?;
        let (b, _, h, w) = feats.dims4()?;
        let k = self.config.num_labels;
        let hw = h * w;
        let dim = batch.dim;
        let stride = dim as f32 / w as f32;

        let cls = cells_last(&candle_nn::ops::softmax(&self.cls_head.forward(&feats)?, 1)?)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let boxes = cells_last(&candle_nn::ops::sigmoid(&self.box_head.forward(&feats)?)?)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let masks = cells_last(&candle_nn::ops::softmax(&self.mask_head.forward(&feats)?, 1)?)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let mut out = Vec::with_capacity(b);
        for img in 0..b {
            let mut candidates = Vec::new();
            for cell in 0..hw {
                let at = img * hw + cell;
                let probs = &cls[at * k..][..k];
                let Some((label, score)) = probs
                    .iter()
                    .enumerate()
                    .skip(1)
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(l, s)| (l as u32, *s))
                else {
                    continue;
                };
                if score < box_threshold {
                    continue;
                }
                let cx = (cell % w) as f32 * stride + stride / 2.0;
                let cy = (cell / w) as f32 * stride + stride / 2.0;
                let ltrb = &boxes[at * 4..][..4];
                let d = dim as f32;
                let bbox = [
                    (cx - ltrb[0] * d).max(0.0),
                    (cy - ltrb[1] * d).max(0.0),
                    (cx + ltrb[2] * d).min(d),
                    (cy + ltrb[3] * d).min(d),
                ];
                candidates.push(Detection {
                    label,
                    score,
                    bbox,
                    mask: None,
                });
            }

            let mut kept = nms(candidates, NMS_IOU, MAX_DETECTIONS);
            for det in &mut kept {
                let mut grid = Mask::zeros(w as u32, h as u32);
                for cell in 0..hw {
                    if masks[(img * hw + cell) * k + det.label as usize] > MASK_THRESHOLD {
                        grid.set((cell % w) as u32, (cell / w) as u32, true);
                    }
                }
                det.mask = Some(crop_to_box(&grid.resize_nearest(dim, dim), &det.bbox));
            }
            out.push(kept);
        }
        Ok(out)
    }

    fn trainable_parameters(&self) -> Result<Vec<(String, Var)>, MlError> {
        let freeze = self.config.freeze_batch_norm;
        Ok(self
            .named_parameters()?
            .into_iter()
            .filter(|(name, _)| !name.contains("running_"))
            .filter(|(name, _)| !(freeze && name.contains(".bn.")))
            .collect())
    }

    fn named_parameters(&self) -> Result<Vec<(String, Var)>, MlError> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| MlError::model("parameter map lock poisoned"))?;
        let mut params: Vec<(String, Var)> =
            data.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn crop_to_box(mask: &Mask, bbox: &[f32; 4]) -> Mask {
    let mut out = Mask::zeros(mask.width(), mask.height());
    let x0 = bbox[0].floor().max(0.0) as u32;
    let y0 = bbox[1].floor().max(0.0) as u32;
    let x1 = (bbox[2].ceil() as u32).min(mask.width());
    let y1 = (bbox[3].ceil() as u32).min(mask.height());
    for y in y0..y1 {
        for x in x0..x1 {
            if mask.get(x, y) {
                out.set(x, y, true);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::Sample;
    use crate::model::scalar;

    fn batch(device: &Device) -> Batch {
        let dim = 64;
        let mut mask = Mask::zeros(dim, dim);
        for y in 8..40 {
            for x in 16..48 {
                mask.set(x, y, true);
            }
        }
        let sample = Sample {
            image_id: "synthetic".into(),
            dim,
            image: vec![128; 3 * 64 * 64],
            labels: vec![2],
            boxes: vec![[16.0, 8.0, 48.0, 40.0]],
            masks: vec![mask],
        };
        Batch::from_samples(vec![sample.clone(), sample], vec![0, 1], device).unwrap()
    }

    fn model(freeze: bool) -> DenseSegmenter {
        DenseSegmenter::new(
            DenseConfig {
                num_labels: 3,
                fpn_channels: 8,
                freeze_batch_norm: freeze,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_losses_are_finite_and_named() {
        let model = model(true);
        let losses = model.forward_losses(&batch(&Device::Cpu), true).unwrap();
        let values = losses.values().unwrap();
        let names: Vec<&str> = values.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["loss_classifier", "loss_box_reg", "loss_mask"]);
        assert!(values.iter().all(|(_, v)| v.is_finite()));
        assert!(scalar(&losses.total().unwrap()).unwrap() > 0.0);
    }

    #[test]
    fn test_frozen_batch_norm_excluded_from_trainable() {
        let frozen = model(true);
        let all = frozen.named_parameters().unwrap();
        let trainable = frozen.trainable_parameters().unwrap();
        assert!(all.iter().any(|(n, _)| n == "backbone.stem.bn.weight"));
        assert!(trainable.iter().all(|(n, _)| !n.contains(".bn.")));
        assert!(trainable.iter().any(|(n, _)| n == "heads.cls.weight"));

        let unfrozen = model(false);
        let trainable = unfrozen.trainable_parameters().unwrap();
        assert!(trainable.iter().any(|(n, _)| n == "backbone.stem.bn.weight"));
        assert!(trainable.iter().all(|(n, _)| !n.contains("running_")));
    }

    #[test]
    fn test_predict_respects_threshold() {
        let model = model(true);
        let batch = batch(&Device::Cpu);
        let none = model.predict(&batch, 1.1).unwrap();
        assert_eq!(none.len(), 2);
        assert!(none.iter().all(Vec::is_empty));

        let some = model.predict(&batch, 0.0).unwrap();
        for dets in &some {
            assert!(dets.len() <= MAX_DETECTIONS);
            for det in dets {
                assert!(det.label >= 1 && det.label < 3);
                assert!(det.bbox[0] <= det.bbox[2] && det.bbox[2] <= 64.0);
                assert_eq!(det.mask.as_ref().map(Mask::width), Some(64));
            }
        }
    }

    #[test]
    fn test_rejects_background_only() {
        let err = DenseSegmenter::new(
            DenseConfig {
                num_labels: 1,
                fpn_channels: 8,
                freeze_batch_norm: true,
            },
            &Device::Cpu,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_backbone_roundtrip_through_safetensors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("backbone.safetensors");
        let source = model(true);
        let tensors: std::collections::HashMap<String, Tensor> = source
            .named_parameters()
            .unwrap()
            .into_iter()
            .filter(|(n, _)| n.starts_with("backbone."))
            .map(|(n, v)| (n, v.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let target = model(true);
        let loaded = target.load_backbone(&path).unwrap();
        assert_eq!(loaded, tensors.len());
        let a = source.named_parameters().unwrap();
        let b = target.named_parameters().unwrap();
        let (_, va) = a.iter().find(|(n, _)| n == "backbone.stem.conv.weight").unwrap();
        let (_, vb) = b.iter().find(|(n, _)| n == "backbone.stem.conv.weight").unwrap();
        let diff = (va.as_tensor() - vb.as_tensor()).unwrap().abs().unwrap();
        assert_eq!(diff.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }
}
