//! Box geometry and non-maximum suppression.

use crate::model::Detection;

pub const NMS_IOU: f32 = 0.5;
pub const MAX_DETECTIONS: usize = 100;

pub fn box_area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

pub fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let union = box_area(a) + box_area(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Class-wise greedy NMS, keeping at most `max_keep` detections by score.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32, max_keep: usize) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::new();
    for det in detections {
        if kept.len() == max_keep {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|k| k.label == det.label && box_iou(&k.bbox, &det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}
