//! Writes accumulated samples to disk as PNG files plus a JSON summary.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::{ColorType, ImageFormat};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use super::dataset::{CroppedSample, DatasetStats};
use super::error::{Result, SegmentationError};
use super::region::HandType;

pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const DATASET_TYPE: &str = "hand_segmentation";
pub const ENGINE_ID: &str = "RustHandSegmentationEngine";

/// Host-supplied names end up as directory names; only plain single components are allowed.
pub fn check_path_component(name: &str) -> Result<&str> {
    let invalid = name.is_empty()
        || name.contains("..")
        || name.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
        || Path::new(name).is_absolute();
    if invalid {
        warn!("⚠️ Rejected path component {:?}", name);
        return Err(SegmentationError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub total_images: usize,
    pub creation_timestamp: i64,
    pub dataset_type: String,
    pub hand_types: BTreeMap<String, usize>,
    pub average_confidence: f64,
    pub processing_engine: String,
    pub timespan_ms: u64,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SavedDataset {
    pub directory: PathBuf,
    pub images_written: usize,
    pub metadata: Option<DatasetMetadata>,
}

#[derive(Debug, Clone)]
pub struct DatasetPersister {
    engine_id: String,
}

impl DatasetPersister {
    pub fn new() -> Self {
        Self {
            engine_id: ENGINE_ID.to_string(),
        }
    }

    pub fn with_engine_id(engine_id: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
        }
    }

    /// `hand_{type}_{timestamp}_{index:04}.png`
    pub fn sample_file_name(sample: &CroppedSample, index: usize) -> String {
        format!(
            "hand_{}_{}_{:04}.png",
            sample.hand_type.as_str(),
            sample.timestamp,
            index
        )
    }

    /// `cropped_dataset_{label}`, falling back to the local time.
    pub fn dataset_dir_name(label: Option<&str>) -> Result<String> {
        match label {
            Some(label) if !label.is_empty() => {
                Ok(format!("cropped_dataset_{}", check_path_component(label)?))
            }
            _ => Ok(format!(
                "cropped_dataset_{}",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            )),
        }
    }

    /// Saves `samples` under `output_dir`. Per-image failures are skipped; the returned count
    /// reflects files actually written.
    pub fn save(
        &self,
        samples: &[CroppedSample],
        output_dir: &Path,
        label: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<SavedDataset> {
        if samples.is_empty() {
            warn!("⚠️ No cropped samples to save");
            return Err(SegmentationError::NoData);
        }

        let dataset_dir = output_dir.join(Self::dataset_dir_name(label)?);
        fs::create_dir_all(&dataset_dir).map_err(|e| {
            error!("❌ Failed to create dataset directory {:?}: {}", dataset_dir, e);
            e
        })?;

        info!(
            "💾 Saving {} cropped hand images to {:?}",
            samples.len(),
            dataset_dir
        );

        let mut written = Vec::with_capacity(samples.len());
        for (index, sample) in samples.iter().enumerate() {
            let file_name = Self::sample_file_name(sample, index);
            match Self::write_png(sample, &dataset_dir.join(&file_name)) {
                Ok(()) => written.push(SampleSummary::of(sample)),
                Err(e) => warn!("⚠️ Failed to save cropped image {}: {}", file_name, e),
            }
        }

        let metadata = self.build_metadata(&written, session_id);
        let metadata = match Self::write_metadata(&dataset_dir, &metadata) {
            Ok(()) => Some(metadata),
            Err(e) => {
                warn!("⚠️ Failed to save dataset metadata: {}", e);
                None
            }
        };

        info!("✅ Saved {} cropped hand images", written.len());
        Ok(SavedDataset {
            directory: dataset_dir,
            images_written: written.len(),
            metadata,
        })
    }

    fn write_png(sample: &CroppedSample, path: &Path) -> Result<()> {
        sample.image.validate()?;
        image::save_buffer_with_format(
            path,
            &sample.image.data,
            sample.image.width,
            sample.image.height,
            ColorType::Rgba8,
            ImageFormat::Png,
        )?;
        Ok(())
    }

    fn build_metadata(
        &self,
        written: &[SampleSummary],
        session_id: Option<&str>,
    ) -> DatasetMetadata {
        let mut hand_types = BTreeMap::new();
        for summary in written {
            *hand_types
                .entry(summary.hand_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        let average_confidence = if written.is_empty() {
            0.0
        } else {
            written.iter().map(|s| s.confidence as f64).sum::<f64>() / written.len() as f64
        };
        let first = written.iter().map(|s| s.timestamp).min().unwrap_or(0);
        let last = written.iter().map(|s| s.timestamp).max().unwrap_or(0);

        DatasetMetadata {
            total_images: written.len(),
            creation_timestamp: chrono::Utc::now().timestamp_millis(),
            dataset_type: DATASET_TYPE.to_string(),
            hand_types,
            average_confidence,
            processing_engine: self.engine_id.clone(),
            timespan_ms: last - first,
            session_id: session_id.map(str::to_string),
        }
    }

    fn write_metadata(dataset_dir: &Path, metadata: &DatasetMetadata) -> Result<()> {
        let file = File::create(dataset_dir.join(METADATA_FILE_NAME))?;
        serde_json::to_writer_pretty(BufWriter::new(file), metadata)?;
        Ok(())
    }
}

impl Default for DatasetPersister {
    fn default() -> Self {
        Self::new()
    }
}

/// Image-free view of a written sample.
#[derive(Debug, Clone, Copy)]
struct SampleSummary {
    hand_type: HandType,
    confidence: f32,
    timestamp: u64,
}

impl SampleSummary {
    fn of(sample: &CroppedSample) -> Self {
        Self {
            hand_type: sample.hand_type,
            confidence: sample.confidence,
            timestamp: sample.timestamp,
        }
    }
}

impl From<&DatasetMetadata> for DatasetStats {
    fn from(metadata: &DatasetMetadata) -> Self {
        let count = |key: &str| metadata.hand_types.get(key).copied().unwrap_or(0);
        DatasetStats {
            total: metadata.total_images,
            left: count("left"),
            right: count("right"),
            unknown: count("unknown"),
            average_confidence: metadata.average_confidence,
            timespan_ms: metadata.timespan_ms,
        }
    }
}
