//! Per-recording-session lifecycle around one [`SegmentationEngine`].

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::cancel::CancellationGenerator;
use super::dataset::DatasetStats;
use super::engine::{EngineConfig, SegmentationEngine};
use super::error::{Result, SegmentationError};
use super::frame::Frame;
use super::listener::SegmentationListener;
use super::persist::{check_path_component, SavedDataset};
use super::video::{self, VideoDecoder, VideoProcessingReport, VideoSampling};

pub const SESSIONS_DIR: &str = "sessions";
pub const SEGMENTATION_DIR: &str = "hand_segmentation";
pub const VIDEO_FRAMES_DIR: &str = "video_frames";

/// Flags read by the facade; only the [`SessionManager`] setters write them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub is_enabled: bool,
    pub is_real_time_processing_enabled: bool,
    pub is_dataset_accumulation_enabled: bool,
    pub current_session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Initialized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    /// Threads for frame jobs; 0 picks from the CPU count.
    pub frame_workers: usize,
    pub real_time_by_default: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            frame_workers: 0,
            real_time_by_default: true,
        }
    }
}

impl SessionConfig {
    fn worker_threads(&self) -> usize {
        if self.frame_workers > 0 {
            self.frame_workers
        } else {
            num_cpus::get().clamp(1, 4)
        }
    }
}

/// Handle to work running on the background pool.
pub struct BackgroundTask<T> {
    receiver: Receiver<Result<T>>,
}

impl<T> BackgroundTask<T> {
    /// Blocks until the task finishes.
    pub fn wait(self) -> Result<T> {
        self.receiver
            .recv()
            .map_err(|_| SegmentationError::TaskDropped)?
    }

    /// `None` while the task is still running.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.receiver.try_recv().ok()
    }
}

/// Counts queued and running jobs so callers can wait for quiescence.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard(Arc::clone(self))
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct SessionManager {
    root_dir: PathBuf,
    config: SessionConfig,
    engine: Arc<SegmentationEngine>,
    state: RwLock<SessionState>,
    lifecycle: RwLock<Lifecycle>,
    listener: RwLock<Option<Arc<dyn SegmentationListener>>>,
    decoder: Option<Arc<dyn VideoDecoder>>,
    frame_generations: CancellationGenerator,
    video_generations: CancellationGenerator,
    processing_lock: Arc<Mutex<()>>,
    in_flight: Arc<InFlight>,
    frame_pool: rayon::ThreadPool,
    background_pool: rayon::ThreadPool,
}

impl SessionManager {
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(root_dir, SessionConfig::default())
    }

    pub fn with_config(root_dir: impl Into<PathBuf>, config: SessionConfig) -> Result<Self> {
        let frame_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads())
            .thread_name(|i| format!("handseg-frame-{}", i))
            .build()?;
        let background_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|_| "handseg-io".to_string())
            .build()?;

        Ok(Self {
            root_dir: root_dir.into(),
            engine: Arc::new(SegmentationEngine::with_config(config.engine.clone())),
            state: RwLock::new(SessionState::default()),
            lifecycle: RwLock::new(Lifecycle::Idle),
            listener: RwLock::new(None),
            decoder: None,
            frame_generations: CancellationGenerator::new(),
            video_generations: CancellationGenerator::new(),
            processing_lock: Arc::new(Mutex::new(())),
            in_flight: Arc::new(InFlight::default()),
            frame_pool,
            background_pool,
            config,
        })
    }

    pub fn with_video_decoder(mut self, decoder: Arc<dyn VideoDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn engine(&self) -> &Arc<SegmentationEngine> {
        &self.engine
    }

    /// `{root}/sessions/{session_id}/hand_segmentation`
    pub fn session_output_dir(root_dir: &Path, session_id: &str) -> Result<PathBuf> {
        Ok(root_dir
            .join(SESSIONS_DIR)
            .join(check_path_component(session_id)?)
            .join(SEGMENTATION_DIR))
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn SegmentationListener>>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = listener.clone();
        self.engine.set_listener(listener);
    }

    /// Binds the engine to a new session. Work and samples from a previous session are
    /// discarded first.
    pub fn initialize(&self, session_id: &str) -> Result<PathBuf> {
        let output_dir = Self::session_output_dir(&self.root_dir, session_id)?;
        if self.lifecycle() == Lifecycle::Initialized {
            info!("🔄 Replacing active session before starting {}", session_id);
            self.cleanup();
        }

        self.engine
            .set_listener(self.listener.read().unwrap_or_else(PoisonError::into_inner).clone());
        self.engine.initialize(&output_dir)?;

        self.update_state(|state| {
            state.current_session_id = Some(session_id.to_string());
            state.is_real_time_processing_enabled = self.config.real_time_by_default;
        });
        *self.lifecycle.write().unwrap_or_else(PoisonError::into_inner) = Lifecycle::Initialized;

        info!("✅ Session {} initialized at {:?}", session_id, output_dir);
        Ok(output_dir)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.update_state(|state| state.is_enabled = enabled);
        if !enabled {
            self.frame_generations.cancel_all();
        }
        info!("Hand segmentation {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_real_time_processing(&self, enabled: bool) {
        self.update_state(|state| state.is_real_time_processing_enabled = enabled);
        if !enabled {
            self.frame_generations.cancel_all();
        }
        debug!("Real-time processing: {}", enabled);
    }

    /// Turning accumulation off drops every sample collected so far.
    pub fn set_dataset_accumulation_enabled(&self, enabled: bool) {
        self.update_state(|state| state.is_dataset_accumulation_enabled = enabled);
        if !enabled {
            self.engine.clear_dataset();
        }
        debug!("Dataset accumulation: {}", enabled);
    }

    /// Whether an incoming frame would be processed right now.
    pub fn should_process(&self) -> bool {
        let state = self.state();
        self.lifecycle() == Lifecycle::Initialized
            && state.is_enabled
            && state.is_real_time_processing_enabled
    }

    fn update_state(&self, f: impl FnOnce(&mut SessionState)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        self.engine
            .set_accumulation_enabled(state.is_enabled && state.is_dataset_accumulation_enabled);
    }

    /// Schedules `frame` for processing, superseding any job still in flight.
    ///
    /// Returns `Ok(false)` when processing is switched off for this session.
    pub fn submit_frame(&self, frame: Frame) -> Result<bool> {
        if self.lifecycle() != Lifecycle::Initialized {
            return Err(self.not_initialized());
        }
        if !self.should_process() {
            return Ok(false);
        }

        let token = self.frame_generations.next_token();
        let guard = self.in_flight.enter();
        let engine = Arc::clone(&self.engine);
        let processing_lock = Arc::clone(&self.processing_lock);

        self.frame_pool.spawn(move || {
            let _guard = guard;
            if token.is_cancelled() {
                return;
            }
            let _busy = processing_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if token.is_cancelled() {
                return;
            }

            let timestamp = frame.timestamp_ms();
            if let Err(e) = engine.process_frame_cancellable(&frame, timestamp, &token) {
                error!("❌ Frame {} dropped: {}", timestamp, e);
                engine.report_error(&e.to_string());
            }
        });
        Ok(true)
    }

    /// Blocks until every queued frame, save and video job has finished.
    ///
    /// Must not be called from a listener callback.
    pub fn wait_idle(&self) {
        self.in_flight.wait_idle();
    }

    pub fn dataset_stats(&self) -> DatasetStats {
        self.engine.dataset_stats()
    }

    /// Persists the session's samples in the background; `label` defaults to the local time.
    pub fn save_dataset(&self, label: Option<String>) -> Result<BackgroundTask<SavedDataset>> {
        if self.lifecycle() != Lifecycle::Initialized {
            return Err(self.not_initialized());
        }

        let engine = Arc::clone(&self.engine);
        let session_id = self.state().current_session_id;
        Ok(self.spawn_background(move || {
            engine.save_dataset(label.as_deref(), session_id.as_deref())
        }))
    }

    /// Samples a recorded video through the host decoder and runs each frame through the
    /// engine. Extracted frames land in `{output}/video_frames`.
    pub fn process_recorded_video(
        &self,
        video_path: impl Into<PathBuf>,
        sampling: VideoSampling,
    ) -> Result<BackgroundTask<VideoProcessingReport>> {
        let output_dir = self
            .engine
            .output_dir()
            .ok_or_else(|| self.not_initialized())?;
        let decoder = self
            .decoder
            .clone()
            .ok_or(SegmentationError::NoVideoDecoder)?;

        let video_path = video_path.into();
        let frames_dir = output_dir.join(VIDEO_FRAMES_DIR);
        let engine = Arc::clone(&self.engine);
        let token = self.video_generations.next_token();

        info!("🎬 Queued video post-processing for {:?}", video_path);
        Ok(self.spawn_background(move || {
            let report = video::process_video(
                &engine,
                decoder.as_ref(),
                &video_path,
                sampling,
                &frames_dir,
                &token,
            );
            if let Err(e) = &report {
                warn!("⚠️ Video post-processing failed: {}", e);
                engine.report_error(&format!("Video post-processing failed: {}", e));
            }
            report
        }))
    }

    /// The engine drops its listener on cleanup, so idle-state errors go through the
    /// session's own copy.
    fn not_initialized(&self) -> SegmentationError {
        let e = SegmentationError::NotInitialized;
        warn!("⚠️ Session not initialized");
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener.on_error(&e.to_string());
        }
        e
    }

    fn spawn_background<T, F>(&self, job: F) -> BackgroundTask<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let guard = self.in_flight.enter();
        self.background_pool.spawn(move || {
            let _guard = guard;
            // caller may have dropped the handle
            sender.send(job()).ok();
        });
        BackgroundTask { receiver }
    }

    /// Cancels outstanding work, releases all samples and returns to `Idle`.
    pub fn cleanup(&self) {
        self.frame_generations.cancel_all();
        self.video_generations.cancel_all();
        self.wait_idle();

        self.engine.cleanup();
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = SessionState::default();
        *self.lifecycle.write().unwrap_or_else(PoisonError::into_inner) = Lifecycle::Idle;
        info!("🗑️ Session cleaned up");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.frame_generations.cancel_all();
        self.video_generations.cancel_all();
        info!("🗑️ SessionManager: released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::segmentation::engine::test_frames::{self, GRAY};
    use crate::core::segmentation::listener::{ChannelListener, SegmentationEvent};
    use crate::core::segmentation::video::fake::FakeDecoder;
    use std::thread;
    use std::time::Duration;

    fn manager() -> (SessionManager, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(temp.path()).unwrap();
        (manager, temp)
    }

    fn enabled_manager(session_id: &str) -> (SessionManager, tempfile::TempDir) {
        let (manager, temp) = manager();
        manager.initialize(session_id).unwrap();
        manager.set_enabled(true);
        (manager, temp)
    }

    #[test]
    fn test_initialize_builds_session_layout() {
        let (manager, temp) = manager();
        assert_eq!(manager.lifecycle(), Lifecycle::Idle);

        let dir = manager.initialize("s-001").unwrap();
        assert_eq!(
            dir,
            temp.path()
                .join("sessions")
                .join("s-001")
                .join("hand_segmentation")
        );
        assert!(dir.is_dir());
        assert_eq!(manager.lifecycle(), Lifecycle::Initialized);
        assert_eq!(manager.state().current_session_id.as_deref(), Some("s-001"));
    }

    #[test]
    fn test_submit_before_initialize_fails() {
        let (manager, _temp) = manager();
        let result = manager.submit_frame(test_frames::two_hands());
        assert!(matches!(result, Err(SegmentationError::NotInitialized)));
    }

    #[test]
    fn test_idle_session_reports_not_initialized() {
        let (manager, _temp) = manager();
        let (listener, events) = ChannelListener::new();
        manager.set_listener(Some(Arc::new(listener)));

        assert!(manager.submit_frame(test_frames::two_hands()).is_err());
        assert!(manager.save_dataset(None).is_err());

        manager.initialize("s").unwrap();
        manager.cleanup();
        assert!(manager.submit_frame(test_frames::two_hands()).is_err());

        let errors = events
            .try_iter()
            .filter(|e| matches!(e, SegmentationEvent::Error(m) if m == "Engine not initialized"))
            .count();
        assert_eq!(errors, 3);
    }

    #[test]
    fn test_session_id_must_be_single_component() {
        let (manager, temp) = manager();
        manager.initialize("good").unwrap();

        for bad in ["../..", "a/b", ""] {
            assert!(matches!(
                manager.initialize(bad),
                Err(SegmentationError::InvalidName(_))
            ));
        }
        // rejected ids leave the active session alone
        assert_eq!(manager.lifecycle(), Lifecycle::Initialized);
        assert_eq!(manager.state().current_session_id.as_deref(), Some("good"));
        assert!(!temp.path().join("sessions").join("a").exists());
    }

    #[test]
    fn test_disabled_session_skips_frames() {
        let (manager, _temp) = manager();
        manager.initialize("s").unwrap();
        let (listener, events) = ChannelListener::new();
        manager.set_listener(Some(Arc::new(listener)));

        assert!(!manager.submit_frame(test_frames::two_hands()).unwrap());

        manager.set_enabled(true);
        manager.set_real_time_processing(false);
        assert!(!manager.submit_frame(test_frames::two_hands()).unwrap());

        manager.wait_idle();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_enabled_session_processes_frames() {
        let (manager, _temp) = enabled_manager("s");
        let (listener, events) = ChannelListener::new();
        manager.set_listener(Some(Arc::new(listener)));

        assert!(manager.submit_frame(test_frames::two_hands()).unwrap());
        manager.wait_idle();

        let detections: Vec<usize> = events
            .try_iter()
            .filter_map(|e| match e {
                SegmentationEvent::Detection(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(detections, vec![2]);
    }

    #[test]
    fn test_accumulation_requires_both_flags() {
        let (manager, _temp) = manager();
        manager.initialize("s").unwrap();
        manager.set_dataset_accumulation_enabled(true);
        assert!(!manager.engine().is_accumulation_enabled());

        manager.set_enabled(true);
        assert!(manager.engine().is_accumulation_enabled());

        manager.submit_frame(test_frames::two_hands()).unwrap();
        manager.wait_idle();
        assert_eq!(manager.dataset_stats().total, 2);

        manager.set_dataset_accumulation_enabled(false);
        assert_eq!(manager.dataset_stats().total, 0);
        assert!(!manager.engine().is_accumulation_enabled());
    }

    #[test]
    fn test_superseded_job_leaves_no_samples() {
        let (manager, _temp) = enabled_manager("s");
        manager.set_dataset_accumulation_enabled(true);
        let (listener, events) = ChannelListener::new();
        manager.set_listener(Some(Arc::new(listener)));

        manager
            .engine()
            .set_commit_stall(Some(Duration::from_millis(300)));
        manager.submit_frame(test_frames::two_hands()).unwrap();
        thread::sleep(Duration::from_millis(50));

        // supersede while the first job is held before its commit
        manager
            .submit_frame(Frame::filled(640, 480, GRAY))
            .unwrap();
        manager.wait_idle();
        manager.engine().set_commit_stall(None);

        assert_eq!(manager.dataset_stats().total, 0);
        let detections: Vec<usize> = events
            .try_iter()
            .filter_map(|e| match e {
                SegmentationEvent::Detection(n) => Some(n),
                _ => None,
            })
            .collect();
        assert!(detections.iter().all(|&n| n == 0));
    }

    #[test]
    fn test_save_with_no_samples_fails() {
        let (manager, _temp) = enabled_manager("s");
        let task = manager.save_dataset(Some("empty".to_string())).unwrap();

        assert!(matches!(task.wait(), Err(SegmentationError::NoData)));
        let output_dir = manager.engine().output_dir().unwrap();
        assert!(!output_dir.join("cropped_dataset_empty").exists());
    }

    #[test]
    fn test_save_dataset_in_background() {
        let (manager, _temp) = enabled_manager("s-42");
        manager.set_dataset_accumulation_enabled(true);
        let (listener, events) = ChannelListener::new();
        manager.set_listener(Some(Arc::new(listener)));

        manager.submit_frame(test_frames::two_hands()).unwrap();
        manager.wait_idle();

        let saved = manager
            .save_dataset(Some("take1".to_string()))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(saved.images_written, 2);
        assert_eq!(
            saved.metadata.unwrap().session_id.as_deref(),
            Some("s-42")
        );
        assert!(events
            .try_iter()
            .any(|e| matches!(e, SegmentationEvent::DatasetSaved { total: 2, .. })));
    }

    #[test]
    fn test_recorded_video_needs_decoder() {
        let (manager, _temp) = enabled_manager("s");
        let result = manager.process_recorded_video("rec.mp4", VideoSampling::default());
        assert!(matches!(result, Err(SegmentationError::NoVideoDecoder)));
    }

    #[test]
    fn test_recorded_video_processing() {
        let temp = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(temp.path())
            .unwrap()
            .with_video_decoder(Arc::new(FakeDecoder {
                duration_ms: 500,
                failing: vec![100],
            }));
        manager.initialize("video").unwrap();

        let report = manager
            .process_recorded_video("rec.mp4", VideoSampling::default())
            .unwrap()
            .wait()
            .unwrap();

        assert_eq!(report.requested, 5);
        assert_eq!(report.extracted, 4);
        assert_eq!(report.failed, 1);
        assert!(report.frames_dir.ends_with("hand_segmentation/video_frames"));
        assert!(report.frames_dir.join("frame_0000_0.png").exists());
    }

    #[test]
    fn test_cleanup_returns_to_idle() {
        let (manager, _temp) = enabled_manager("s");
        manager.set_dataset_accumulation_enabled(true);
        manager.submit_frame(test_frames::two_hands()).unwrap();

        manager.cleanup();
        assert_eq!(manager.lifecycle(), Lifecycle::Idle);
        assert_eq!(manager.state(), SessionState::default());
        assert_eq!(manager.dataset_stats().total, 0);
        assert!(!manager.engine().is_initialized());
    }

    #[test]
    fn test_new_session_discards_previous_samples() {
        let (manager, _temp) = enabled_manager("first");
        manager.set_dataset_accumulation_enabled(true);
        manager.submit_frame(test_frames::two_hands()).unwrap();
        manager.wait_idle();
        assert_eq!(manager.dataset_stats().total, 2);

        let dir = manager.initialize("second").unwrap();
        assert!(dir.ends_with("sessions/second/hand_segmentation"));
        assert_eq!(manager.dataset_stats().total, 0);
        assert!(!manager.state().is_enabled);
    }
}
