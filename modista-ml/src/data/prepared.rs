//! Pre-resized, fixed-size binary dataset stored as a safetensors file.
//!
//! Layout for `N` images at `D x D` with room for `S` segments each:
//!
//! | tensor   | dtype | shape          |
//! |----------|-------|----------------|
//! | `images` | u8    | `[N, 3, D, D]` |
//! | `labels` | i64   | `[N, S]`       |
//! | `masks`  | u8    | `[N, S, D, D]` |
//! | `boxes`  | f32   | `[N, S, 4]`    |
//!
//! A label of 0 marks an unused segment slot.

use crate::data::dataset::{DatasetStats, Sample, SegmentationDataset};
use crate::data::rle::Mask;
use crate::error::MlError;
use candle_core::safetensors::MmapedSafetensors;
use safetensors::tensor::{Dtype, Metadata};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

const IMAGES: &str = "images";
const LABELS: &str = "labels";
const MASKS: &str = "masks";
const BOXES: &str = "boxes";
const FORMAT: &str = "modista-prepared";
const MAX_HEADER_BYTES: u64 = 100_000_000;

/// `imaterialist_<dim>.safetensors` or `imaterialist_test_<dim>.safetensors`.
pub fn prepared_file_name(target_dim: u32, test: bool) -> String {
    if test {
        format!("imaterialist_test_{target_dim}.safetensors")
    } else {
        format!("imaterialist_{target_dim}.safetensors")
    }
}

/// Memory-mapped reader over a prepared dataset file.
pub struct PreparedDataset {
    path: PathBuf,
    tensors: MmapedSafetensors,
    len: usize,
    dim: u32,
    slots: usize,
    segments: usize,
    loads: AtomicUsize,
}

impl std::fmt::Debug for PreparedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedDataset")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("dim", &self.dim)
            .field("slots", &self.slots)
            .finish()
    }
}

impl PreparedDataset {
    pub fn open(path: &Path) -> Result<Self, MlError> {
        if !path.exists() {
            return Err(MlError::not_found(format!(
                "prepared dataset {} (run `modista prepare` first)",
                path.display()
            )));
        }
        // SAFETY: the file is treated as read-only for the lifetime of the map.
        let tensors = unsafe { MmapedSafetensors::new(path)? };

        let images = tensors.get(IMAGES)?;
        expect_dtype(images.dtype(), IMAGES, Dtype::U8, path)?;
        let (len, dim) = match images.shape() {
            [n, 3, h, w] if h == w => (*n, *h as u32),
            other => {
                return Err(MlError::dataset(format!(
                    "{}: images tensor has shape {other:?}, expected [N, 3, D, D]",
                    path.display()
                )));
            }
        };
        let labels = tensors.get(LABELS)?;
        expect_dtype(labels.dtype(), LABELS, Dtype::I64, path)?;
        let slots = match labels.shape() {
            [n, s] if *n == len => *s,
            other => {
                return Err(MlError::dataset(format!(
                    "{}: labels tensor has shape {other:?}",
                    path.display()
                )));
            }
        };
        expect_tensor(
            &tensors,
            MASKS,
            Dtype::U8,
            &[len, slots, dim as usize, dim as usize],
            path,
        )?;
        expect_tensor(&tensors, BOXES, Dtype::F32, &[len, slots, 4], path)?;
        let segments = read_metadata(path)?
            .metadata()
            .as_ref()
            .and_then(|m| m.get("segments"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        tracing::debug!(
            path = %path.display(),
            len,
            dim,
            slots,
            segments,
            "opened prepared dataset"
        );
        Ok(Self {
            path: path.to_path_buf(),
            tensors,
            len,
            dim,
            slots,
            segments,
            loads: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    pub fn max_segments(&self) -> usize {
        self.slots
    }
}

fn expect_dtype(dtype: Dtype, name: &str, expected: Dtype, path: &Path) -> Result<(), MlError> {
    if dtype != expected {
        return Err(MlError::dataset(format!(
            "{}: {name} tensor has dtype {dtype:?}, expected {expected:?}",
            path.display()
        )));
    }
    Ok(())
}

fn expect_tensor(
    tensors: &MmapedSafetensors,
    name: &str,
    dtype: Dtype,
    shape: &[usize],
    path: &Path,
) -> Result<(), MlError> {
    let view = tensors.get(name)?;
    expect_dtype(view.dtype(), name, dtype, path)?;
    if view.shape() != shape {
        return Err(MlError::dataset(format!(
            "{}: {name} tensor has shape {:?}, expected {shape:?}",
            path.display(),
            view.shape()
        )));
    }
    Ok(())
}

impl SegmentationDataset for PreparedDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<Sample, MlError> {
        if index >= self.len {
            return Err(MlError::not_found(format!(
                "image index {index} (dataset has {})",
                self.len
            )));
        }
        let dim = self.dim as usize;
        let plane = dim * dim;
        let slots = self.slots;

        let image_bytes = 3 * plane;
        let image = self.tensors.get(IMAGES)?.data()[index * image_bytes..][..image_bytes].to_vec();

        let labels_view = self.tensors.get(LABELS)?;
        let labels_raw = &labels_view.data()[index * slots * 8..][..slots * 8];
        let boxes_view = self.tensors.get(BOXES)?;
        let boxes_raw = &boxes_view.data()[index * slots * 16..][..slots * 16];
        let masks_view = self.tensors.get(MASKS)?;
        let masks_raw = &masks_view.data()[index * slots * plane..][..slots * plane];

        let mut sample = Sample {
            image_id: index.to_string(),
            dim: self.dim,
            image,
            labels: Vec::new(),
            boxes: Vec::new(),
            masks: Vec::new(),
        };
        for slot in 0..slots {
            let label = i64::from_le_bytes(read_array(&labels_raw[slot * 8..]));
            if label <= 0 {
                continue;
            }
            let mut bbox = [0f32; 4];
            for (k, v) in bbox.iter_mut().enumerate() {
                *v = f32::from_le_bytes(read_array(&boxes_raw[slot * 16 + k * 4..]));
            }
            let mask = Mask::from_raw(
                self.dim,
                self.dim,
                masks_raw[slot * plane..][..plane].to_vec(),
            )?;
            sample.labels.push(label as u32);
            sample.boxes.push(bbox);
            sample.masks.push(mask);
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(sample)
    }

    fn stats(&self) -> DatasetStats {
        DatasetStats {
            images: self.len,
            segments: self.segments,
            loads: self.loads.load(Ordering::Relaxed),
            skipped_segments: 0,
        }
    }
}

/// Parse only the JSON header, leaving tensor data on disk.
fn read_metadata(path: &Path) -> Result<Metadata, MlError> {
    let mut file = File::open(path)?;
    let mut len = [0u8; 8];
    file.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len > MAX_HEADER_BYTES {
        return Err(MlError::dataset(format!(
            "{}: header of {len} bytes is too large",
            path.display()
        )));
    }
    let mut header = vec![0u8; len as usize];
    file.read_exact(&mut header)?;
    Ok(serde_json::from_slice(&header)?)
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Counts reported by [`write_prepared`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub images: usize,
    pub segments: usize,
    pub truncated_images: usize,
}

/// One tensor region of the file: `per_sample` bytes for each of `n` images,
/// starting `offset` bytes into the data section.
struct Region {
    name: &'static str,
    dtype: &'static str,
    shape: Vec<usize>,
    per_sample: usize,
    offset: usize,
}

impl Region {
    fn end(&self) -> usize {
        self.offset + self.shape[0] * self.per_sample
    }
}

/// Wider dtypes first so every region stays aligned to its element size.
fn regions(n: usize, slots: usize, dim: usize) -> Vec<Region> {
    let plane = dim * dim;
    let specs = [
        (LABELS, "I64", vec![n, slots], slots * 8),
        (BOXES, "F32", vec![n, slots, 4], slots * 16),
        (IMAGES, "U8", vec![n, 3, dim, dim], 3 * plane),
        (MASKS, "U8", vec![n, slots, dim, dim], slots * plane),
    ];
    let mut offset = 0;
    specs
        .into_iter()
        .map(|(name, dtype, shape, per_sample)| {
            let region = Region {
                name,
                dtype,
                shape,
                per_sample,
                offset,
            };
            offset = region.end();
            region
        })
        .collect()
}

fn header(regions: &[Region], segments: usize) -> Result<Vec<u8>, MlError> {
    let mut map = serde_json::Map::new();
    map.insert(
        "__metadata__".to_string(),
        serde_json::json!({ "format": FORMAT, "segments": segments.to_string() }),
    );
    for r in regions {
        map.insert(
            r.name.to_string(),
            serde_json::json!({
                "dtype": r.dtype,
                "shape": r.shape,
                "data_offsets": [r.offset, r.end()],
            }),
        );
    }
    Ok(serde_json::to_vec(&serde_json::Value::Object(map))?)
}

/// Materialise `dataset` into a prepared file at `path`.
///
/// Samples are streamed to disk one at a time, so memory use is bounded by a
/// single image. Images carrying more than `max_segments` instances keep the
/// first `max_segments`. The file is written to a temporary sibling and
/// renamed.
pub fn write_prepared(
    dataset: &dyn SegmentationDataset,
    path: &Path,
    max_segments: usize,
) -> Result<PrepareReport, MlError> {
    if dataset.is_empty() {
        return Err(MlError::dataset("cannot prepare an empty dataset"));
    }
    let mut report = None;
    let mut failure = None;
    modista_core::persistence::atomic_write_with(path, |tmp| {
        match stream_samples(dataset, tmp, max_segments) {
            Ok(r) => {
                report = Some(r);
                Ok(())
            }
            Err(e) => {
                failure = Some(e);
                Err(std::io::Error::other("prepared dataset was not written"))
            }
        }
    })
    .map_err(|e| failure.take().unwrap_or(MlError::Io(e)))?;
    let report = report.ok_or_else(|| MlError::dataset("prepared dataset was not written"))?;

    tracing::info!(
        path = %path.display(),
        images = report.images,
        segments = report.segments,
        "wrote prepared dataset"
    );
    Ok(report)
}

fn stream_samples(
    dataset: &dyn SegmentationDataset,
    tmp: &Path,
    slots: usize,
) -> Result<PrepareReport, MlError> {
    let n = dataset.len();
    let first = dataset.get(0)?;
    let dim = first.dim as usize;
    let plane = dim * dim;
    let regions = regions(n, slots, dim);

    // The header is rewritten at the end with the real segment count, which
    // never has more digits than `n * slots`.
    let reserved = header(&regions, n * slots)?.len().next_multiple_of(8);
    let data_start = (8 + reserved) as u64;
    let data_len = regions.last().map_or(0, Region::end);

    let mut file = File::create(tmp)?;
    file.set_len(data_start + data_len as u64)?;

    let mut labels = vec![0u8; slots * 8];
    let mut boxes = vec![0u8; slots * 16];
    let mut masks = vec![0u8; slots * plane];
    let mut report = PrepareReport {
        images: n,
        ..PrepareReport::default()
    };

    let mut pending = Some(first);
    for index in 0..n {
        let sample = match pending.take() {
            Some(sample) => sample,
            None => dataset.get(index)?,
        };
        if sample.dim as usize != dim {
            return Err(MlError::dataset(format!(
                "sample {index} has dim {}, expected {dim}",
                sample.dim
            )));
        }
        if sample.num_instances() > slots {
            report.truncated_images += 1;
            tracing::warn!(
                image_id = %sample.image_id,
                instances = sample.num_instances(),
                max_segments = slots,
                "too many segments, truncating"
            );
        }
        let kept = sample.num_instances().min(slots);
        report.segments += kept;

        labels.fill(0);
        boxes.fill(0);
        masks.fill(0);
        for slot in 0..kept {
            labels[slot * 8..][..8].copy_from_slice(&i64::from(sample.labels[slot]).to_le_bytes());
            for (k, v) in sample.boxes[slot].iter().enumerate() {
                boxes[slot * 16 + k * 4..][..4].copy_from_slice(&v.to_le_bytes());
            }
            masks[slot * plane..][..plane].copy_from_slice(sample.masks[slot].as_raw());
        }

        for region in &regions {
            let bytes: &[u8] = match region.name {
                LABELS => &labels,
                BOXES => &boxes,
                IMAGES => &sample.image,
                _ => &masks,
            };
            if bytes.len() != region.per_sample {
                return Err(MlError::dataset(format!(
                    "sample {index}: {} has {} bytes, expected {}",
                    region.name,
                    bytes.len(),
                    region.per_sample
                )));
            }
            let at = data_start + (region.offset + index * region.per_sample) as u64;
            file.seek(SeekFrom::Start(at))?;
            file.write_all(bytes)?;
        }

        if (index + 1) % 500 == 0 {
            tracing::info!("prepared {}/{} images", index + 1, n);
        }
    }

    let mut head = header(&regions, report.segments)?;
    head.resize(reserved, b' ');
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&(reserved as u64).to_le_bytes())?;
    file.write_all(&head)?;
    file.sync_all()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::InMemoryDataset;
    use pretty_assertions::assert_eq;
    use safetensors::tensor::TensorView;
    use tempfile::TempDir;

    fn sample(id: &str, instances: &[(u32, [u32; 4])]) -> Sample {
        let dim = 8;
        let mut s = Sample {
            image_id: id.to_string(),
            dim,
            image: (0..3 * 64).map(|v| v as u8).collect(),
            labels: Vec::new(),
            boxes: Vec::new(),
            masks: Vec::new(),
        };
        for (label, [x0, y0, x1, y1]) in instances {
            let mut mask = Mask::zeros(dim, dim);
            for y in *y0..*y1 {
                for x in *x0..*x1 {
                    mask.set(x, y, true);
                }
            }
            s.boxes.push(mask.bbox().unwrap());
            s.labels.push(*label);
            s.masks.push(mask);
        }
        s
    }

    #[test]
    fn test_prepared_file_names() {
        assert_eq!(prepared_file_name(512, false), "imaterialist_512.safetensors");
        assert_eq!(prepared_file_name(256, true), "imaterialist_test_256.safetensors");
    }

    #[test]
    fn test_write_then_read_prepared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(prepared_file_name(8, false));
        let source = InMemoryDataset::new(vec![
            sample("a", &[(3, [0, 0, 4, 4]), (7, [2, 2, 8, 6])]),
            sample("b", &[]),
        ]);

        let report = write_prepared(&source, &path, 4).unwrap();
        assert_eq!(report.images, 2);
        assert_eq!(report.segments, 2);
        assert!(!modista_core::persistence::tmp_path(&path).exists());

        let prepared = PreparedDataset::open(&path).unwrap();
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared.dim(), 8);
        assert_eq!(prepared.max_segments(), 4);

        let a = prepared.get(0).unwrap();
        let expected = source.get(0).unwrap();
        assert_eq!(a.labels, expected.labels);
        assert_eq!(a.boxes, expected.boxes);
        assert_eq!(a.masks, expected.masks);
        assert_eq!(a.image, expected.image);

        let b = prepared.get(1).unwrap();
        assert_eq!(b.num_instances(), 0);
        assert_eq!(b.image, source.get(1).unwrap().image);
        assert!(prepared.get(2).is_err());
        assert_eq!(prepared.stats().loads, 2);
        assert_eq!(prepared.stats().segments, 2);
    }

    #[test]
    fn test_written_file_is_aligned_safetensors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.safetensors");
        let source = InMemoryDataset::new(vec![
            sample("a", &[(3, [0, 0, 4, 4])]),
            sample("b", &[(5, [1, 1, 3, 3]), (6, [4, 4, 8, 8])]),
            sample("c", &[]),
        ]);
        write_prepared(&source, &path, 3).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let (header_len, meta) = safetensors::SafeTensors::read_metadata(&bytes).unwrap();
        assert_eq!(header_len % 8, 0);
        let extra = meta.metadata().clone().unwrap();
        assert_eq!(extra["segments"], "3");
        assert_eq!(extra["format"], FORMAT);

        let tensors = safetensors::SafeTensors::deserialize(&bytes).unwrap();
        let labels = tensors.tensor(LABELS).unwrap();
        assert_eq!(labels.dtype(), Dtype::I64);
        assert_eq!(labels.shape(), &[3, 3]);
        let second: Vec<i64> = labels.data()[24..48]
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(second, vec![5, 6, 0]);
    }

    #[test]
    fn test_open_rejects_wrong_dtype() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("i32_labels.safetensors");
        let images = vec![0u8; 2 * 3 * 64];
        let labels = vec![1u8; 2 * 2 * 4];
        let masks = vec![0u8; 2 * 2 * 64];
        let boxes = vec![0u8; 2 * 2 * 16];
        let views = vec![
            (IMAGES, TensorView::new(Dtype::U8, vec![2, 3, 8, 8], &images).unwrap()),
            (LABELS, TensorView::new(Dtype::I32, vec![2, 2], &labels).unwrap()),
            (MASKS, TensorView::new(Dtype::U8, vec![2, 2, 8, 8], &masks).unwrap()),
            (BOXES, TensorView::new(Dtype::F32, vec![2, 2, 4], &boxes).unwrap()),
        ];
        safetensors::serialize_to_file(views, &None, &path).unwrap();

        let err = PreparedDataset::open(&path).unwrap_err();
        assert!(matches!(err, MlError::Dataset(_)), "{err}");
    }

    #[test]
    fn test_write_truncates_extra_segments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.safetensors");
        let source = InMemoryDataset::new(vec![sample(
            "a",
            &[(1, [0, 0, 1, 1]), (2, [1, 1, 2, 2]), (3, [2, 2, 3, 3])],
        )]);
        let report = write_prepared(&source, &path, 2).unwrap();
        assert_eq!(report.truncated_images, 1);
        let prepared = PreparedDataset::open(&path).unwrap();
        assert_eq!(prepared.get(0).unwrap().labels, vec![1, 2]);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = PreparedDataset::open(&dir.path().join("nope.safetensors")).unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
    }
}
