//! COCO-style average precision for boxes and masks.
//!
//! AP is the mean over classes with ground truth of the 101-point
//! interpolated precision, averaged over IoU thresholds 0.50:0.05:0.95.

use crate::data::loader::Target;
use crate::data::rle::Mask;
use crate::model::Detection;
use crate::model::postprocess::box_iou;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const RECALL_POINTS: usize = 101;

fn iou_thresholds() -> impl Iterator<Item = f64> {
    (0..10).map(|i| 0.5 + 0.05 * i as f64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ApStats {
    pub ap: f64,
    pub ap50: f64,
    pub ap75: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub bbox: ApStats,
    pub segm: ApStats,
    pub images: usize,
    pub detections: usize,
}

impl std::fmt::Display for EvalSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, s) in [("bbox", &self.bbox), ("segm", &self.segm)] {
            writeln!(
                f,
                "IoU metric: {name}  AP@[.50:.95] = {:.3}  AP@.50 = {:.3}  AP@.75 = {:.3}",
                s.ap, s.ap50, s.ap75
            )?;
        }
        write!(f, "{} images, {} detections", self.images, self.detections)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IouType {
    Bbox,
    Segm,
}

#[derive(Debug)]
struct ImageRecord {
    gt_labels: Vec<u32>,
    gt_boxes: Vec<[f32; 4]>,
    gt_masks: Vec<Mask>,
    detections: Vec<Detection>,
}

/// Accumulates detections and ground truth, image by image.
#[derive(Debug, Default)]
pub struct CocoEvaluator {
    images: Vec<ImageRecord>,
}

impl CocoEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, target: &Target, detections: Vec<Detection>) {
        self.images.push(ImageRecord {
            gt_labels: target.labels.clone(),
            gt_boxes: target.boxes.clone(),
            gt_masks: target.masks.clone(),
            detections,
        });
    }

    pub fn summarize(&self) -> EvalSummary {
        EvalSummary {
            bbox: self.stats(IouType::Bbox),
            segm: self.stats(IouType::Segm),
            images: self.images.len(),
            detections: self.images.iter().map(|i| i.detections.len()).sum(),
        }
    }

    fn stats(&self, kind: IouType) -> ApStats {
        let classes: BTreeSet<u32> = self
            .images
            .iter()
            .flat_map(|i| i.gt_labels.iter().copied())
            .collect();
        if classes.is_empty() {
            return ApStats::default();
        }

        let mut ap = 0.0;
        let mut ap50 = 0.0;
        let mut ap75 = 0.0;
        for &class in &classes {
            let per_threshold: Vec<f64> = iou_thresholds()
                .map(|t| self.class_ap(class, t, kind))
                .collect();
            ap += per_threshold.iter().sum::<f64>() / per_threshold.len() as f64;
            ap50 += per_threshold[0];
            ap75 += per_threshold[5];
        }
        let n = classes.len() as f64;
        ApStats {
            ap: ap / n,
            ap50: ap50 / n,
            ap75: ap75 / n,
        }
    }

    fn class_ap(&self, class: u32, threshold: f64, kind: IouType) -> f64 {
        let mut total_gt = 0usize;
        // (score, is true positive)
        let mut scored: Vec<(f32, bool)> = Vec::new();

        for image in &self.images {
            let gts: Vec<usize> = (0..image.gt_labels.len())
                .filter(|&g| image.gt_labels[g] == class)
                .collect();
            total_gt += gts.len();

            let mut dets: Vec<&Detection> = image
                .detections
                .iter()
                .filter(|d| d.label == class)
                .filter(|d| kind == IouType::Bbox || d.mask.is_some())
                .collect();
            dets.sort_by(|a, b| b.score.total_cmp(&a.score));

            let mut matched = vec![false; gts.len()];
            for det in dets {
                let mut best: Option<(usize, f64)> = None;
                for (slot, &g) in gts.iter().enumerate() {
                    if matched[slot] {
                        continue;
                    }
                    let iou = match (kind, &det.mask) {
                        (IouType::Bbox, _) => box_iou(&det.bbox, &image.gt_boxes[g]) as f64,
                        (IouType::Segm, Some(mask)) => mask.iou(&image.gt_masks[g]) as f64,
                        (IouType::Segm, None) => 0.0,
                    };
                    if iou >= threshold && best.is_none_or(|(_, b)| iou > b) {
                        best = Some((slot, iou));
                    }
                }
                if let Some((slot, _)) = best {
                    matched[slot] = true;
                }
                scored.push((det.score, best.is_some()));
            }
        }

        if total_gt == 0 {
            return 0.0;
        }
        // Stable so equal scores keep image order.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        interpolated_ap(&scored, total_gt)
    }
}

/// 101-point interpolated AP over a score-sorted list of TP/FP flags.
fn interpolated_ap(scored: &[(f32, bool)], total_gt: usize) -> f64 {
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut recall = Vec::with_capacity(scored.len());
    let mut precision = Vec::with_capacity(scored.len());
    for &(_, is_tp) in scored {
        if is_tp {
            tp += 1;
        } else {
            fp += 1;
        }
        recall.push(tp as f64 / total_gt as f64);
        precision.push(tp as f64 / (tp + fp) as f64);
    }
    for i in (1..precision.len()).rev() {
        if precision[i] > precision[i - 1] {
            precision[i - 1] = precision[i];
        }
    }

    let mut sum = 0.0;
    for r in 0..RECALL_POINTS {
        let level = r as f64 / (RECALL_POINTS - 1) as f64;
        let idx = recall.partition_point(|&rc| rc < level);
        if idx < precision.len() {
            sum += precision[idx];
        }
    }
    sum / RECALL_POINTS as f64
}
