//! Session-scoped collection of cropped hand samples.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::frame::Frame;
use super::region::{BoundingBox, HandRegion, HandType};

pub const DEFAULT_CROP_PADDING: u32 = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct CroppedSample {
    pub image: Frame,
    /// Padded box after clamping, in source-frame coordinates.
    pub bounding_box: BoundingBox,
    pub timestamp: u64,
    pub hand_type: HandType,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total: usize,
    pub left: usize,
    pub right: usize,
    pub unknown: usize,
    pub average_confidence: f64,
    pub timespan_ms: u64,
}

impl DatasetStats {
    pub fn from_samples(samples: &[CroppedSample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let count_of = |hand_type| samples.iter().filter(|s| s.hand_type == hand_type).count();
        let confidence_sum: f64 = samples.iter().map(|s| s.confidence as f64).sum();
        let first = samples.iter().map(|s| s.timestamp).min().unwrap_or(0);
        let last = samples.iter().map(|s| s.timestamp).max().unwrap_or(0);

        Self {
            total: samples.len(),
            left: count_of(HandType::Left),
            right: count_of(HandType::Right),
            unknown: count_of(HandType::Unknown),
            average_confidence: confidence_sum / samples.len() as f64,
            timespan_ms: last - first,
        }
    }
}

/// Crops padded sub-images of `regions` out of `frame`, in detection order.
///
/// Regions whose clamped box is empty are skipped.
pub fn crop_samples(
    frame: &Frame,
    regions: &[HandRegion],
    timestamp: u64,
    padding: u32,
) -> Vec<CroppedSample> {
    let mut samples = Vec::with_capacity(regions.len());

    for region in regions {
        let Some(padded) = region
            .bounding_box
            .padded_within(padding, frame.width, frame.height)
        else {
            debug!("Skipping empty crop for {:?}", region.bounding_box);
            continue;
        };

        match frame.crop(padded.min_x, padded.min_y, padded.width(), padded.height()) {
            Ok(image) => samples.push(CroppedSample {
                image,
                bounding_box: padded,
                timestamp,
                hand_type: region.hand_type,
                confidence: region.confidence,
            }),
            Err(e) => warn!("⚠️ Failed to crop hand region: {}", e),
        }
    }

    samples
}

#[derive(Debug, Default)]
pub struct DatasetAccumulator {
    samples: Vec<CroppedSample>,
}

impl DatasetAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crops `regions` from `frame` and appends them; returns the newly added samples.
    pub fn accumulate(
        &mut self,
        frame: &Frame,
        regions: &[HandRegion],
        timestamp: u64,
        padding: u32,
    ) -> &[CroppedSample] {
        let samples = crop_samples(frame, regions, timestamp, padding);
        self.commit(samples)
    }

    /// Appends already-cropped samples in order.
    pub fn commit(&mut self, samples: Vec<CroppedSample>) -> &[CroppedSample] {
        let start = self.samples.len();
        self.samples.extend(samples);
        &self.samples[start..]
    }

    pub fn samples(&self) -> &[CroppedSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats::from_samples(&self.samples)
    }

    /// Removes every sample and releases the image buffers.
    pub fn clear(&mut self) {
        let dropped = self.samples.len();
        self.samples = Vec::new();
        info!("🗑️ Cropped dataset cleared ({} samples)", dropped);
    }

    /// Takes every sample out, leaving the collection empty.
    pub fn drain(&mut self) -> Vec<CroppedSample> {
        std::mem::take(&mut self.samples)
    }
}
