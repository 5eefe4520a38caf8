//! Frame pipeline: classify → extract → render → accumulate.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::cancel::CancellationToken;
use super::dataset::{crop_samples, DatasetAccumulator, DatasetStats, DEFAULT_CROP_PADDING};
use super::error::{Result, SegmentationError};
use super::frame::Frame;
use super::listener::SegmentationListener;
use super::persist::{DatasetPersister, SavedDataset};
use super::region::{HandRegion, RegionExtractor, MAX_HANDS, MIN_HAND_AREA};
use super::render::FrameRenderer;
use super::skin::{SkinMaskClassifier, SkinThresholds};

/// Resolution at which [`MIN_HAND_AREA`] was tuned.
pub const REFERENCE_WIDTH: u32 = 640;
pub const REFERENCE_HEIGHT: u32 = 480;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub thresholds: SkinThresholds,
    pub min_hand_area: usize,
    pub max_hands: usize,
    pub crop_padding: u32,
    pub render_mask: bool,
    pub render_annotated: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thresholds: SkinThresholds::default(),
            min_hand_area: MIN_HAND_AREA,
            max_hands: MAX_HANDS,
            crop_padding: DEFAULT_CROP_PADDING,
            render_mask: true,
            render_annotated: true,
        }
    }
}

impl EngineConfig {
    /// Minimum area scaled by pixel count relative to 640x480.
    pub fn scaled_for(width: u32, height: u32) -> Self {
        let reference = (REFERENCE_WIDTH * REFERENCE_HEIGHT) as f64;
        let ratio = (width as f64 * height as f64) / reference;
        Self {
            min_hand_area: ((MIN_HAND_AREA as f64 * ratio).round() as usize).max(1),
            ..Self::default()
        }
    }

    /// 320x240 preview streams; skips the overlay render.
    pub fn for_low_resolution() -> Self {
        Self {
            crop_padding: DEFAULT_CROP_PADDING / 2,
            render_annotated: false,
            ..Self::scaled_for(320, 240)
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SegmentationResult {
    /// Best first, at most `max_hands` entries.
    pub detected_hands: Vec<HandRegion>,
    pub mask_image: Option<Frame>,
    pub annotated_image: Option<Frame>,
    pub processing_time_ms: u64,
}

impl SegmentationResult {
    pub fn empty(processing_time_ms: u64) -> Self {
        Self {
            processing_time_ms,
            ..Self::default()
        }
    }

    pub fn has_hands(&self) -> bool {
        !self.detected_hands.is_empty()
    }
}

pub struct SegmentationEngine {
    config: EngineConfig,
    classifier: SkinMaskClassifier,
    extractor: RegionExtractor,
    renderer: FrameRenderer,
    persister: DatasetPersister,
    accumulator: Mutex<DatasetAccumulator>,
    output_dir: RwLock<Option<PathBuf>>,
    accumulation_enabled: AtomicBool,
    listener: RwLock<Option<Arc<dyn SegmentationListener>>>,
    #[cfg(test)]
    commit_stall: Mutex<Option<std::time::Duration>>,
}

impl SegmentationEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            classifier: SkinMaskClassifier::with_thresholds(config.thresholds),
            extractor: RegionExtractor::new()
                .with_min_hand_area(config.min_hand_area)
                .with_max_hands(config.max_hands),
            renderer: FrameRenderer::new(),
            persister: DatasetPersister::new(),
            accumulator: Mutex::new(DatasetAccumulator::new()),
            output_dir: RwLock::new(None),
            accumulation_enabled: AtomicBool::new(false),
            listener: RwLock::new(None),
            #[cfg(test)]
            commit_stall: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn SegmentationListener>>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    /// Creates `output_dir` if needed and marks the engine ready.
    pub fn initialize(&self, output_dir: impl AsRef<Path>) -> Result<()> {
        let output_dir = output_dir.as_ref();
        if let Err(e) = fs::create_dir_all(output_dir) {
            error!(
                "❌ Failed to create output directory {:?}: {}",
                output_dir, e
            );
            self.notify(|l| l.on_error(&format!("Failed to create output directory: {}", e)));
            return Err(e.into());
        }

        *self.output_dir.write().unwrap_or_else(PoisonError::into_inner) =
            Some(output_dir.to_path_buf());
        info!("✅ Hand segmentation engine initialized at {:?}", output_dir);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.output_dir().is_some()
    }

    pub fn output_dir(&self) -> Option<PathBuf> {
        self.output_dir
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_accumulation_enabled(&self, enabled: bool) {
        self.accumulation_enabled.store(enabled, Ordering::Release);
    }

    pub fn is_accumulation_enabled(&self) -> bool {
        self.accumulation_enabled.load(Ordering::Acquire)
    }

    /// Runs the full pipeline on one frame.
    ///
    /// Only `NotInitialized` is returned as an error; failures inside the pipeline are
    /// reported through `on_error` and yield an empty result.
    pub fn process_frame(&self, frame: &Frame, timestamp: u64) -> Result<SegmentationResult> {
        let token = CancellationToken::standalone();
        let result = self.process_frame_cancellable(frame, timestamp, &token)?;
        Ok(result.unwrap_or_default())
    }

    /// Like [`SegmentationEngine::process_frame`], but returns `Ok(None)` without touching the
    /// accumulator or the listener once `token` is cancelled.
    pub fn process_frame_cancellable(
        &self,
        frame: &Frame,
        timestamp: u64,
        token: &CancellationToken,
    ) -> Result<Option<SegmentationResult>> {
        if !self.is_initialized() {
            return Err(self.not_initialized());
        }

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_pipeline(frame, timestamp, token, start)
        }))
        .unwrap_or_else(|payload| {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(SegmentationError::Processing(reason))
        });

        match outcome {
            Ok(Some((result, progress))) => {
                self.notify(|l| {
                    l.on_detection(result.detected_hands.len());
                    l.on_result(&result);
                    if let Some(stats) = progress {
                        l.on_dataset_progress(stats.total, stats.left, stats.right);
                    }
                });
                Ok(Some(result))
            }
            Ok(None) => {
                debug!("Frame {} superseded, result discarded", timestamp);
                Ok(None)
            }
            Err(e) => {
                let message = if let SegmentationError::Processing(_) = &e {
                    e.to_string()
                } else {
                    SegmentationError::Processing(e.to_string()).to_string()
                };
                error!("❌ {}", message);
                self.notify(|l| l.on_error(&message));
                Ok(Some(SegmentationResult::empty(elapsed_ms(start))))
            }
        }
    }

    fn run_pipeline(
        &self,
        frame: &Frame,
        timestamp: u64,
        token: &CancellationToken,
        start: Instant,
    ) -> Result<Option<(SegmentationResult, Option<DatasetStats>)>> {
        frame.validate()?;

        let mask = self.classifier.classify(frame);
        if token.is_cancelled() {
            return Ok(None);
        }
        let regions = self.extractor.extract(&mask, timestamp);
        drop(mask);
        if token.is_cancelled() {
            return Ok(None);
        }

        let mask_image = self
            .config
            .render_mask
            .then(|| self.renderer.render_mask(frame.width, frame.height, &regions));
        let annotated_image = self
            .config
            .render_annotated
            .then(|| self.renderer.render_annotated(frame, &regions));

        // crop locally, publish only after the last cancellation check
        let pending = if self.is_accumulation_enabled() && !regions.is_empty() {
            crop_samples(frame, &regions, timestamp, self.config.crop_padding)
        } else {
            Vec::new()
        };

        self.stall_before_commit();

        let progress = {
            let mut accumulator = self.lock_accumulator();
            if token.is_cancelled() {
                return Ok(None);
            }
            if !pending.is_empty() && self.is_accumulation_enabled() {
                accumulator.commit(pending);
                Some(accumulator.stats())
            } else {
                None
            }
        };

        let result = SegmentationResult {
            detected_hands: regions,
            mask_image,
            annotated_image,
            processing_time_ms: elapsed_ms(start),
        };
        debug!(
            "Frame {}: {} hands in {}ms",
            timestamp,
            result.detected_hands.len(),
            result.processing_time_ms
        );
        Ok(Some((result, progress)))
    }

    fn lock_accumulator(&self) -> MutexGuard<'_, DatasetAccumulator> {
        // commit is a single extend, so a poisoned collection is still consistent
        self.accumulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dataset_stats(&self) -> DatasetStats {
        self.lock_accumulator().stats()
    }

    pub fn dataset_len(&self) -> usize {
        self.lock_accumulator().len()
    }

    /// Read access to the accumulated samples between frames.
    pub fn with_dataset<R>(&self, f: impl FnOnce(&DatasetAccumulator) -> R) -> R {
        f(&self.lock_accumulator())
    }

    pub fn clear_dataset(&self) {
        self.lock_accumulator().clear();
    }

    /// Writes the accumulated samples under the output directory. Samples stay in memory
    /// whether or not the save succeeds.
    pub fn save_dataset(&self, label: Option<&str>, session_id: Option<&str>) -> Result<SavedDataset> {
        let output_dir = self.output_dir().ok_or_else(|| self.not_initialized())?;

        let saved = {
            let accumulator = self.lock_accumulator();
            self.persister
                .save(accumulator.samples(), &output_dir, label, session_id)
        };

        match &saved {
            Ok(dataset) => self.notify(|l| {
                l.on_dataset_saved(&dataset.directory, dataset.images_written)
            }),
            Err(e) => {
                warn!("⚠️ Dataset save failed: {}", e);
                let message = format!("Failed to save dataset: {}", e);
                self.notify(|l| l.on_error(&message));
            }
        }
        saved
    }

    /// Drops all samples and the listener and returns to the uninitialized state.
    pub fn cleanup(&self) {
        self.clear_dataset();
        self.set_accumulation_enabled(false);
        self.set_listener(None);
        *self.output_dir.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!("🗑️ Hand segmentation engine cleaned up");
    }

    fn not_initialized(&self) -> SegmentationError {
        let e = SegmentationError::NotInitialized;
        warn!("⚠️ {}", e);
        self.report_error(&e.to_string());
        e
    }

    /// Forwards an error raised outside the frame pipeline to the listener.
    pub fn report_error(&self, message: &str) {
        self.notify(|l| l.on_error(message));
    }

    fn notify(&self, f: impl FnOnce(&dyn SegmentationListener)) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            f(listener.as_ref());
        }
    }

    #[cfg(test)]
    pub(crate) fn set_commit_stall(&self, stall: Option<std::time::Duration>) {
        *self.commit_stall.lock().unwrap() = stall;
    }

    #[cfg(test)]
    fn stall_before_commit(&self) {
        let stall = *self.commit_stall.lock().unwrap();
        if let Some(stall) = stall {
            std::thread::sleep(stall);
        }
    }

    #[cfg(not(test))]
    fn stall_before_commit(&self) {}
}

impl Default for SegmentationEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
