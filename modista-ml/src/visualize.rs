//! Qualitative output: predicted boxes and masks drawn over a test image.

use crate::data::annotations::CategoryTable;
use crate::data::dataset::Sample;
use crate::data::rle::Mask;
use crate::error::MlError;
use crate::model::Detection;
use image::{Rgba, RgbaImage};
use std::path::{Path, PathBuf};

const MASK_ALPHA: f32 = 0.45;
const BOX_THICKNESS: u32 = 2;

pub struct Visualizer {
    images_dir: PathBuf,
    categories: CategoryTable,
}

impl Visualizer {
    pub fn new(images_dir: impl Into<PathBuf>, categories: CategoryTable) -> Self {
        Self {
            images_dir: images_dir.into(),
            categories,
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Draw `detections` over `sample` and save `epoch_<e>_img_<index>.png`.
    pub fn render(
        &self,
        sample: &Sample,
        detections: &[Detection],
        epoch: usize,
        index: usize,
    ) -> Result<PathBuf, MlError> {
        let mut canvas = image::DynamicImage::ImageRgb8(sample.to_rgb()).into_rgba8();

        for det in detections {
            let color = label_color(det.label);
            if let Some(mask) = &det.mask {
                blend_mask(&mut canvas, mask, color);
            }
            draw_rect(&mut canvas, det.bbox, color, BOX_THICKNESS);
            tracing::info!(
                image_id = %sample.image_id,
                label = det.label,
                category = %self.categories.label_name(det.label),
                score = det.score,
                bbox = ?det.bbox,
                "detection"
            );
        }

        let path = self
            .images_dir
            .join(format!("epoch_{epoch}_img_{index}.png"));
        save_png(&canvas, &path)?;
        Ok(path)
    }

    /// Draw the ground-truth instances of `sample` to `epoch_<e>_img_<index>_gt.png`.
    pub fn render_ground_truth(
        &self,
        sample: &Sample,
        epoch: usize,
        index: usize,
    ) -> Result<PathBuf, MlError> {
        let truth: Vec<Detection> = sample
            .labels
            .iter()
            .zip(&sample.boxes)
            .zip(&sample.masks)
            .map(|((&label, &bbox), mask)| Detection {
                label,
                score: 1.0,
                bbox,
                mask: Some(mask.clone()),
            })
            .collect();
        let mut canvas = image::DynamicImage::ImageRgb8(sample.to_rgb()).into_rgba8();
        for det in &truth {
            let color = label_color(det.label);
            if let Some(mask) = &det.mask {
                blend_mask(&mut canvas, mask, color);
            }
            draw_rect(&mut canvas, det.bbox, color, BOX_THICKNESS);
        }
        let path = self
            .images_dir
            .join(format!("epoch_{epoch}_img_{index}_gt.png"));
        save_png(&canvas, &path)?;
        Ok(path)
    }
}

fn save_png(canvas: &RgbaImage, path: &Path) -> Result<(), MlError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    canvas.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

/// Stable, well-spread colour per label.
pub fn label_color(label: u32) -> Rgba<u8> {
    let h = label.wrapping_mul(2_654_435_761);
    Rgba([
        64 + (h >> 24) as u8 % 192,
        64 + (h >> 16) as u8 % 192,
        64 + (h >> 8) as u8 % 192,
        255,
    ])
}

fn blend_mask(img: &mut RgbaImage, mask: &Mask, color: Rgba<u8>) {
    let w = img.width().min(mask.width());
    let h = img.height().min(mask.height());
    for y in 0..h {
        for x in 0..w {
            if !mask.get(x, y) {
                continue;
            }
            let px = img.get_pixel_mut(x, y);
            for c in 0..3 {
                let v = px[c] as f32 * (1.0 - MASK_ALPHA) + color[c] as f32 * MASK_ALPHA;
                px[c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

fn draw_rect(img: &mut RgbaImage, bbox: [f32; 4], color: Rgba<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp = |v: f32, max: u32| v.max(0.0).min((max - 1) as f32) as u32;
    let x0 = clamp(bbox[0], w);
    let y0 = clamp(bbox[1], h);
    let x1 = clamp(bbox[2] - 1.0, w);
    let y1 = clamp(bbox[3] - 1.0, h);
    if x0 > x1 || y0 > y1 {
        return;
    }
    for t in 0..thickness {
        let (xx0, yy0) = (x0 + t, y0 + t);
        let (xx1, yy1) = (x1.saturating_sub(t), y1.saturating_sub(t));
        if xx0 > xx1 || yy0 > yy1 {
            break;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, color);
            img.put_pixel(x, yy1, color);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, color);
            img.put_pixel(xx1, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample() -> Sample {
        let mut mask = Mask::zeros(16, 16);
        for y in 2..14 {
            for x in 2..14 {
                mask.set(x, y, true);
            }
        }
        Sample {
            image_id: "a".into(),
            dim: 16,
            image: vec![0; 3 * 256],
            labels: vec![3],
            boxes: vec![[2.0, 2.0, 14.0, 14.0]],
            masks: vec![mask],
        }
    }

    #[test]
    fn test_render_writes_named_png() {
        let dir = TempDir::new().unwrap();
        let vis = Visualizer::new(dir.path().join("Images"), CategoryTable::default());
        let s = sample();
        let det = Detection {
            label: 3,
            score: 0.9,
            bbox: s.boxes[0],
            mask: Some(s.masks[0].clone()),
        };
        let path = vis.render(&s, &[det], 10, 1).unwrap();
        assert_eq!(path, dir.path().join("Images").join("epoch_10_img_1.png"));

        let img = image::open(&path).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (16, 16));
        // Box border takes the label colour.
        assert_eq!(*img.get_pixel(2, 2), label_color(3));
        // Untouched background stays black.
        assert_eq!(*img.get_pixel(15, 15), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_render_ground_truth() {
        let dir = TempDir::new().unwrap();
        let vis = Visualizer::new(dir.path(), CategoryTable::default());
        let path = vis.render_ground_truth(&sample(), 0, 1).unwrap();
        assert!(path.ends_with("epoch_0_img_1_gt.png"));
        let img = image::open(&path).unwrap().to_rgba8();
        // Mask interior is blended, not overwritten.
        let inner = img.get_pixel(7, 7);
        assert!(inner[0] > 0 && inner[0] < label_color(3)[0]);
    }

    #[test]
    fn test_label_colors_are_stable() {
        assert_eq!(label_color(5), label_color(5));
        assert_ne!(label_color(1), label_color(2));
    }
}
