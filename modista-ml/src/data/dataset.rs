//! Datasets yielding resized images with per-instance labels, boxes and masks.

use crate::data::annotations::SegmentRecord;
use crate::data::rle::{self, Mask};
use crate::error::MlError;
use image::{RgbImage, imageops::FilterType};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// One training/evaluation example at `dim x dim` resolution.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image_id: String,
    pub dim: u32,
    /// RGB, channel-major (`3 x dim x dim`).
    pub image: Vec<u8>,
    /// Class id + 1 per instance; 0 is reserved for background.
    pub labels: Vec<u32>,
    /// `[x0, y0, x1, y1]` in pixels.
    pub boxes: Vec<[f32; 4]>,
    pub masks: Vec<Mask>,
}

impl Sample {
    pub fn num_instances(&self) -> usize {
        self.labels.len()
    }

    /// Build a sample from an interleaved RGB image.
    pub fn from_rgb(image_id: impl Into<String>, rgb: &RgbImage) -> Self {
        let (w, h) = rgb.dimensions();
        let plane = (w * h) as usize;
        let mut chw = vec![0u8; plane * 3];
        for (i, px) in rgb.pixels().enumerate() {
            chw[i] = px[0];
            chw[plane + i] = px[1];
            chw[2 * plane + i] = px[2];
        }
        Self {
            image_id: image_id.into(),
            dim: w,
            image: chw,
            labels: Vec::new(),
            boxes: Vec::new(),
            masks: Vec::new(),
        }
    }

    /// Interleaved RGB copy of the image, used for rendering.
    pub fn to_rgb(&self) -> RgbImage {
        let plane = (self.dim * self.dim) as usize;
        RgbImage::from_fn(self.dim, self.dim, |x, y| {
            let i = (y * self.dim + x) as usize;
            image::Rgb([
                self.image[i],
                self.image[plane + i],
                self.image[2 * plane + i],
            ])
        })
    }
}

/// Load counters, reported after each checkpoint save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetStats {
    pub images: usize,
    pub segments: usize,
    pub loads: usize,
    pub skipped_segments: usize,
}

/// Random-access dataset of [`Sample`]s.
pub trait SegmentationDataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Sample, MlError>;

    fn stats(&self) -> DatasetStats;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dataset backed by the CSV manifest and the JPEG files under `<root>/Data/train`.
pub struct ManifestDataset {
    image_dir: PathBuf,
    images: Vec<(String, Vec<SegmentRecord>)>,
    target_dim: u32,
    segments: usize,
    loads: AtomicUsize,
    skipped: AtomicUsize,
}

impl ManifestDataset {
    pub fn new(root: &Path, records: &[SegmentRecord], target_dim: u32) -> Self {
        Self::with_image_dir(root.join("Data").join("train"), records, target_dim)
    }

    pub fn with_image_dir(image_dir: PathBuf, records: &[SegmentRecord], target_dim: u32) -> Self {
        let mut images: Vec<(String, Vec<SegmentRecord>)> = Vec::new();
        let mut index = std::collections::HashMap::new();
        for r in records {
            let slot = *index.entry(r.image_id.clone()).or_insert_with(|| {
                images.push((r.image_id.clone(), Vec::new()));
                images.len() - 1
            });
            images[slot].1.push(r.clone());
        }
        Self {
            image_dir,
            images,
            target_dim,
            segments: records.len(),
            loads: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        }
    }

    pub fn image_ids(&self) -> impl Iterator<Item = &str> {
        self.images.iter().map(|(id, _)| id.as_str())
    }

    fn image_path(&self, image_id: &str) -> PathBuf {
        if Path::new(image_id).extension().is_some() {
            self.image_dir.join(image_id)
        } else {
            self.image_dir.join(format!("{image_id}.jpg"))
        }
    }
}

impl SegmentationDataset for ManifestDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize) -> Result<Sample, MlError> {
        let (image_id, segments) = self.images.get(index).ok_or_else(|| {
            MlError::not_found(format!("image index {index} (dataset has {})", self.len()))
        })?;
        let path = self.image_path(image_id);
        let dim = self.target_dim;
        let rgb = image::open(&path)
            .map_err(|e| MlError::dataset(format!("cannot read {}: {e}", path.display())))?
            .to_rgb8();
        let rgb = image::imageops::resize(&rgb, dim, dim, FilterType::Triangle);

        let mut sample = Sample::from_rgb(image_id.clone(), &rgb);
        let mut skipped = 0;
        for segment in segments {
            let mask = rle::decode(&segment.encoded_pixels, segment.height, segment.width)?
                .resize_nearest(dim, dim);
            match mask.bbox() {
                Some(bbox) if bbox[2] > bbox[0] && bbox[3] > bbox[1] => {
                    sample.labels.push(segment.class_id + 1);
                    sample.boxes.push(bbox);
                    sample.masks.push(mask);
                }
                _ => skipped += 1,
            }
        }

        self.loads.fetch_add(1, Ordering::Relaxed);
        if skipped > 0 {
            self.skipped.fetch_add(skipped, Ordering::Relaxed);
            tracing::debug!(image_id = %image_id, skipped, "dropped degenerate segments");
        }
        Ok(sample)
    }

    fn stats(&self) -> DatasetStats {
        DatasetStats {
            images: self.images.len(),
            segments: self.segments,
            loads: self.loads.load(Ordering::Relaxed),
            skipped_segments: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// In-memory dataset, used for synthetic data and tests.
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl SegmentationDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample, MlError> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| MlError::not_found(format!("sample index {index}")))
    }

    fn stats(&self) -> DatasetStats {
        DatasetStats {
            images: self.samples.len(),
            segments: self.samples.iter().map(Sample::num_instances).sum(),
            loads: 0,
            skipped_segments: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn segment(image: &str, rle: &str, class_id: u32) -> SegmentRecord {
        SegmentRecord {
            image_id: image.to_string(),
            encoded_pixels: rle.to_string(),
            height: 8,
            width: 8,
            class_id,
            attribute_ids: None,
        }
    }

    #[test]
    fn test_rgb_roundtrip_through_chw() {
        let rgb = RgbImage::from_fn(4, 4, |x, y| image::Rgb([x as u8, y as u8, 7]));
        let sample = Sample::from_rgb("a", &rgb);
        assert_eq!(sample.image.len(), 48);
        assert_eq!(sample.to_rgb(), rgb);
    }

    #[test]
    fn test_manifest_dataset_loads_and_skips() {
        let dir = TempDir::new().unwrap();
        let image_dir = dir.path().join("train");
        std::fs::create_dir_all(&image_dir).unwrap();
        RgbImage::from_pixel(8, 8, image::Rgb([200, 10, 10]))
            .save(image_dir.join("img1.jpg"))
            .unwrap();

        let records = vec![
            // Column 0, rows 0..4.
            segment("img1", "1 4", 5),
            // Empty segment is dropped.
            segment("img1", "", 2),
        ];
        let dataset = ManifestDataset::with_image_dir(image_dir, &records, 64);
        assert_eq!(dataset.len(), 1);

        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.dim, 64);
        assert_eq!(sample.labels, vec![6]);
        assert_eq!(sample.boxes[0], [0.0, 0.0, 8.0, 32.0]);
        assert_eq!(sample.masks[0].width(), 64);

        let stats = dataset.stats();
        assert_eq!(stats.images, 1);
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.skipped_segments, 1);
    }

    #[test]
    fn test_manifest_dataset_groups_in_order() {
        let records = vec![
            segment("b", "1 1", 0),
            segment("a", "1 1", 0),
            segment("b", "2 1", 1),
        ];
        let dataset = ManifestDataset::with_image_dir(PathBuf::from("/nowhere"), &records, 64);
        let ids: Vec<_> = dataset.image_ids().collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(dataset.get(5).is_err());
    }
}
