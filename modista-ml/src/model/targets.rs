//! Dense training targets on the stride-8 grid.

use crate::data::loader::Target;
use crate::model::postprocess::box_area;

/// Targets for one image on an `grid x grid` lattice.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTargets {
    pub grid: usize,
    /// Label per cell (0 = background), row-major.
    pub classes: Vec<u32>,
    /// Normalised `(l, t, r, b)` distances per cell, zero on negatives.
    pub boxes: Vec<[f32; 4]>,
    /// 1.0 where the cell carries a box target.
    pub positive: Vec<f32>,
    /// Per-pixel label from the instance masks, row-major.
    pub semantic: Vec<u32>,
}

impl DenseTargets {
    pub fn num_positive(&self) -> usize {
        self.positive.iter().filter(|&&p| p > 0.0).count()
    }
}

/// Assign every cell the smallest box that contains its centre, and every
/// mask pixel the smallest instance covering it.
pub fn assign(target: &Target, dim: u32, stride: u32) -> DenseTargets {
    let grid = (dim / stride) as usize;
    let cells = grid * grid;
    let mut out = DenseTargets {
        grid,
        classes: vec![0; cells],
        boxes: vec![[0.0; 4]; cells],
        positive: vec![0.0; cells],
        semantic: vec![0; cells],
    };
    let scale = dim as f32;
    let mut best_box = vec![f32::INFINITY; cells];
    let mut best_mask = vec![usize::MAX; cells];
    let areas: Vec<usize> = target.masks.iter().map(|m| m.area()).collect();

    for gy in 0..grid {
        for gx in 0..grid {
            let cell = gy * grid + gx;
            let px = gx as u32 * stride + stride / 2;
            let py = gy as u32 * stride + stride / 2;
            let (cx, cy) = (px as f32 + 0.5, py as f32 + 0.5);

            for (i, (label, bbox)) in target.labels.iter().zip(&target.boxes).enumerate() {
                let inside = cx > bbox[0] && cx < bbox[2] && cy > bbox[1] && cy < bbox[3];
                let area = box_area(bbox);
                if inside && area < best_box[cell] {
                    best_box[cell] = area;
                    out.classes[cell] = *label;
                    out.positive[cell] = 1.0;
                    out.boxes[cell] = [
                        (cx - bbox[0]) / scale,
                        (cy - bbox[1]) / scale,
                        (bbox[2] - cx) / scale,
                        (bbox[3] - cy) / scale,
                    ];
                }

                let Some(mask) = target.masks.get(i) else {
                    continue;
                };
                if px < mask.width() && py < mask.height() && mask.get(px, py) && areas[i] < best_mask[cell]
                {
                    best_mask[cell] = areas[i];
                    out.semantic[cell] = *label;
                }
            }
        }
    }
    out
}
