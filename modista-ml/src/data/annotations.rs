//! Annotation manifests: the segment table (`train.csv`) and the
//! category/attribute descriptions (`label_descriptions.json`).

use crate::error::MlError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One annotated segment of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    #[serde(rename = "ImageId")]
    pub image_id: String,
    #[serde(rename = "EncodedPixels")]
    pub encoded_pixels: String,
    #[serde(rename = "Height")]
    pub height: u32,
    #[serde(rename = "Width")]
    pub width: u32,
    /// Older exports append attribute ids (`"6_28_77"`); only the class is kept.
    #[serde(rename = "ClassId", deserialize_with = "deserialize_class_id")]
    pub class_id: u32,
    #[serde(rename = "AttributesIds", default)]
    pub attribute_ids: Option<String>,
}

fn deserialize_class_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let head = raw.split('_').next().unwrap_or_default().trim();
    head.parse::<u32>()
        .map_err(|_| serde::de::Error::custom(format!("invalid ClassId '{raw}'")))
}

/// An entry of `label_descriptions.json` (categories and attributes share the shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub supercategory: String,
    #[serde(default)]
    pub level: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelDescriptions {
    #[serde(default)]
    pub categories: Vec<LabelEntry>,
    #[serde(default)]
    pub attributes: Vec<LabelEntry>,
}

pub fn load_label_descriptions(path: &Path) -> Result<LabelDescriptions, MlError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MlError::annotation(format!("cannot read {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&content)?)
}

pub fn read_segments(path: &Path) -> Result<Vec<SegmentRecord>, MlError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

/// Class id → category lookup, after any class filtering.
#[derive(Debug, Clone, Default)]
pub struct CategoryTable {
    entries: Vec<LabelEntry>,
    by_id: HashMap<u32, usize>,
}

impl CategoryTable {
    pub fn new(entries: Vec<LabelEntry>) -> Self {
        let by_id = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();
        Self { entries, by_id }
    }

    pub fn entries(&self) -> &[LabelEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, class_id: u32) -> Option<&LabelEntry> {
        self.by_id.get(&class_id).map(|&i| &self.entries[i])
    }

    /// Name for a model label (class id + 1; 0 is background).
    pub fn label_name(&self, label: u32) -> String {
        match label.checked_sub(1) {
            None => "background".to_string(),
            Some(class_id) => self
                .get(class_id)
                .map(|e| e.name.clone())
                .unwrap_or_else(|| format!("class_{class_id}")),
        }
    }
}

/// Segments split into train/test by image, plus class metadata.
#[derive(Debug, Clone)]
pub struct ProcessedData {
    pub num_classes: usize,
    pub num_attributes: usize,
    pub train: Vec<SegmentRecord>,
    pub test: Vec<SegmentRecord>,
    pub train_images: usize,
    pub test_images: usize,
    pub categories: CategoryTable,
}

impl ProcessedData {
    /// Output classes the model needs: background plus every class id seen.
    pub fn num_labels(&self) -> usize {
        let max_id = self
            .train
            .iter()
            .chain(&self.test)
            .map(|r| r.class_id as usize + 1)
            .max()
            .unwrap_or(0);
        1 + self.num_classes.max(max_id)
    }
}

/// Load `<root>/Data/{train.csv,label_descriptions.json}` and split them.
pub fn process_data(
    root: &Path,
    data_limit: Option<usize>,
    train_fraction: f64,
    allowed_classes: Option<&[u32]>,
) -> Result<ProcessedData, MlError> {
    let data_dir = root.join("Data");
    let labels = load_label_descriptions(&data_dir.join("label_descriptions.json"))?;
    let records = read_segments(&data_dir.join("train.csv"))?;
    let processed = split_records(records, labels, data_limit, train_fraction, allowed_classes)?;

    tracing::info!(
        train_segments = processed.train.len(),
        test_segments = processed.test.len(),
        train_images = processed.train_images,
        test_images = processed.test_images,
        "Train data size [{}] test data size [{}] (counting in segments)",
        processed.train.len(),
        processed.test.len()
    );
    for entry in processed.categories.entries() {
        tracing::debug!(
            id = entry.id,
            name = %entry.name,
            supercategory = %entry.supercategory,
            level = entry.level,
            "category"
        );
    }
    tracing::info!("Total # of classes: {}", processed.num_classes);
    tracing::info!("Total # of attributes: {}", processed.num_attributes);
    Ok(processed)
}

/// Pure part of [`process_data`]: filter classes, limit images and split.
///
/// Images are taken in order of first appearance; the first
/// `floor(n * train_fraction)` form the train split.
pub fn split_records(
    records: Vec<SegmentRecord>,
    labels: LabelDescriptions,
    data_limit: Option<usize>,
    train_fraction: f64,
    allowed_classes: Option<&[u32]>,
) -> Result<ProcessedData, MlError> {
    let num_classes = match allowed_classes {
        Some(allowed) => allowed.len(),
        None => records
            .iter()
            .map(|r| r.class_id)
            .collect::<HashSet<_>>()
            .len(),
    };

    let records: Vec<SegmentRecord> = match allowed_classes {
        Some(allowed) => records
            .into_iter()
            .filter_map(|mut r| {
                let pos = allowed.iter().position(|&c| c == r.class_id)?;
                r.class_id = pos as u32;
                Some(r)
            })
            .collect(),
        None => records,
    };

    let mut seen = HashSet::new();
    let mut image_ids: Vec<&str> = Vec::new();
    for r in &records {
        if seen.insert(r.image_id.as_str()) {
            image_ids.push(r.image_id.as_str());
        }
    }
    if let Some(limit) = data_limit {
        tracing::info!("Data is limited to [{limit}] images");
        image_ids.truncate(limit);
    }
    if image_ids.is_empty() {
        return Err(MlError::dataset("annotation table contains no images"));
    }

    let train_count = (image_ids.len() as f64 * train_fraction) as usize;
    let train_ids: HashSet<String> = image_ids[..train_count]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let kept_ids: HashSet<String> = image_ids.iter().map(|s| s.to_string()).collect();
    let train_images = train_ids.len();
    let test_images = kept_ids.len() - train_images;

    let (train, test): (Vec<_>, Vec<_>) = records
        .into_iter()
        .filter(|r| kept_ids.contains(&r.image_id))
        .partition(|r| train_ids.contains(&r.image_id));

    let categories = match allowed_classes {
        Some(allowed) => labels
            .categories
            .iter()
            .filter_map(|c| {
                let pos = allowed.iter().position(|&a| a == c.id)?;
                Some(LabelEntry {
                    id: pos as u32,
                    ..c.clone()
                })
            })
            .collect(),
        None => labels.categories.clone(),
    };

    Ok(ProcessedData {
        num_classes,
        num_attributes: labels.attributes.len(),
        train,
        test,
        train_images,
        test_images,
        categories: CategoryTable::new(categories),
    })
}
