//! 手部分割 - 实时帧处理 + 裁剪数据集

use crate::core::segmentation::{
    DatasetStats, EngineConfig, Frame, RawFrame, SegmentationError, SegmentationListener,
    SegmentationResult, SessionConfig, SessionManager, SessionState,
};
use flutter_rust_bridge::frb;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// 平均处理耗时的滑动窗口大小
pub const PROCESSING_WINDOW: usize = 30;

/// 手部分割 API 错误类型，FRB 友好的设计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandSegApiError {
    pub error_type: String,
    pub message: String,
}

impl From<SegmentationError> for HandSegApiError {
    fn from(e: SegmentationError) -> Self {
        let error_type = match &e {
            SegmentationError::NotInitialized => "NotInitialized",
            SegmentationError::Io(_) => "Io",
            SegmentationError::Image(_) => "Image",
            SegmentationError::Json(_) => "Json",
            SegmentationError::Decode { .. } => "Decode",
            SegmentationError::Processing(_) => "Processing",
            SegmentationError::InvalidFrame(_) => "InvalidFrame",
            SegmentationError::NoData => "NoData",
            SegmentationError::InvalidName(_) => "InvalidName",
            SegmentationError::TaskDropped => "TaskDropped",
            SegmentationError::NoVideoDecoder => "NoVideoDecoder",
            SegmentationError::WorkerPool(_) => "WorkerPool",
        };
        Self {
            error_type: error_type.to_string(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for HandSegApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

impl std::error::Error for HandSegApiError {}

/// 处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    Idle,
    Ready,
    Processing,
    Error,
}

/// 检测统计快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSnapshot {
    pub state: ProcessingState,
    pub frames_processed: u64,
    pub frames_with_hands: u64,
    pub last_detection_count: u32,
    /// 最近 30 帧的平均耗时
    pub average_processing_ms: f64,
    pub last_error: Option<String>,
}

struct TrackerInner {
    state: ProcessingState,
    frames_processed: u64,
    frames_with_hands: u64,
    last_detection_count: u32,
    recent_times: VecDeque<u64>,
    last_error: Option<String>,
}

impl TrackerInner {
    fn new(state: ProcessingState) -> Self {
        Self {
            state,
            frames_processed: 0,
            frames_with_hands: 0,
            last_detection_count: 0,
            recent_times: VecDeque::with_capacity(PROCESSING_WINDOW),
            last_error: None,
        }
    }

    fn record(&mut self, result: &SegmentationResult) {
        self.frames_processed += 1;
        if result.has_hands() {
            self.frames_with_hands += 1;
        }
        self.last_detection_count = result.detected_hands.len() as u32;
        if self.recent_times.len() == PROCESSING_WINDOW {
            self.recent_times.pop_front();
        }
        self.recent_times.push_back(result.processing_time_ms);
        self.state = ProcessingState::Ready;
    }

    fn snapshot(&self) -> ProcessingSnapshot {
        let average_processing_ms = if self.recent_times.is_empty() {
            0.0
        } else {
            self.recent_times.iter().sum::<u64>() as f64 / self.recent_times.len() as f64
        };
        ProcessingSnapshot {
            state: self.state,
            frames_processed: self.frames_processed,
            frames_with_hands: self.frames_with_hands,
            last_detection_count: self.last_detection_count,
            average_processing_ms,
            last_error: self.last_error.clone(),
        }
    }
}

/// Listener installed on the session: keeps the observable state current and forwards every
/// callback to the host listener, if any.
struct DetectionTracker {
    inner: Mutex<TrackerInner>,
    forward: RwLock<Option<Arc<dyn SegmentationListener>>>,
}

impl DetectionTracker {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner::new(ProcessingState::Idle)),
            forward: RwLock::new(None),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut TrackerInner) -> R) -> R {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_state(&self, state: ProcessingState) -> ProcessingState {
        self.update(|inner| std::mem::replace(&mut inner.state, state))
    }

    fn reset(&self, state: ProcessingState) {
        self.update(|inner| *inner = TrackerInner::new(state));
    }

    fn snapshot(&self) -> ProcessingSnapshot {
        self.update(|inner| inner.snapshot())
    }

    fn forward(&self, f: impl FnOnce(&dyn SegmentationListener)) {
        let listener = self
            .forward
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            f(listener.as_ref());
        }
    }
}

impl SegmentationListener for DetectionTracker {
    fn on_detection(&self, region_count: usize) {
        self.forward(|l| l.on_detection(region_count));
    }

    fn on_result(&self, result: &SegmentationResult) {
        self.update(|inner| inner.record(result));
        self.forward(|l| l.on_result(result));
    }

    fn on_dataset_progress(&self, total: usize, left: usize, right: usize) {
        self.forward(|l| l.on_dataset_progress(total, left, right));
    }

    fn on_dataset_saved(&self, path: &Path, total: usize) {
        self.forward(|l| l.on_dataset_saved(path, total));
    }

    fn on_error(&self, message: &str) {
        self.update(|inner| {
            inner.state = ProcessingState::Error;
            inner.last_error = Some(message.to_string());
        });
        self.forward(|l| l.on_error(message));
    }
}

/// 手部分割器 - 肤色检测 + 连通域 + 数据集裁剪
///
/// ```dart
/// final seg = HandSegmentation.create(rootDir: dir, sessionId: "s-001");
/// seg.setEnabled(enabled: true);
/// seg.processRgbaFrame(width: w, height: h, data: rgba, timestampMs: ts);
/// final snapshot = seg.snapshot;
/// ```
#[frb(opaque)]
pub struct HandSegmentation {
    session: SessionManager,
    tracker: Arc<DetectionTracker>,
}

impl HandSegmentation {
    /// 创建并初始化会话，输出到 `{root_dir}/sessions/{session_id}/hand_segmentation`
    #[frb(sync)]
    pub fn create(root_dir: String, session_id: String) -> Result<Self, HandSegApiError> {
        Self::create_with_config(root_dir, session_id, None)
    }

    /// 同 `create`，可传入 JSON 格式的引擎配置
    #[frb(sync)]
    pub fn create_with_config(
        root_dir: String,
        session_id: String,
        engine_config_json: Option<String>,
    ) -> Result<Self, HandSegApiError> {
        crate::init_logging();
        info!("🖐️ HandSegmentation: creating session {} under {}", session_id, root_dir);

        let engine = match engine_config_json {
            Some(json) => EngineConfig::from_json(&json)?,
            None => EngineConfig::default(),
        };
        let session = SessionManager::with_config(
            root_dir,
            SessionConfig {
                engine,
                ..Default::default()
            },
        )?;

        let tracker = Arc::new(DetectionTracker::new());
        session.set_listener(Some(tracker.clone() as Arc<dyn SegmentationListener>));
        let seg = Self { session, tracker };
        seg.start_session(session_id)?;
        Ok(seg)
    }

    /// 开始新会话（丢弃上一会话的样本）
    #[frb(sync)]
    pub fn start_session(&self, session_id: String) -> Result<String, HandSegApiError> {
        let dir = self.session.initialize(&session_id)?;
        self.tracker.reset(ProcessingState::Ready);
        Ok(dir.to_string_lossy().into_owned())
    }

    #[frb(sync)]
    pub fn set_enabled(&self, enabled: bool) {
        self.session.set_enabled(enabled);
        if !enabled {
            self.settle_cancelled();
        }
    }

    #[frb(sync)]
    pub fn set_real_time_processing(&self, enabled: bool) {
        self.session.set_real_time_processing(enabled);
        if !enabled {
            self.settle_cancelled();
        }
    }

    /// 关闭处理后，被取消的任务不会回调 on_result
    fn settle_cancelled(&self) {
        self.tracker.update(|inner| {
            if inner.state == ProcessingState::Processing {
                inner.state = ProcessingState::Ready;
            }
        });
    }

    #[frb(sync)]
    pub fn set_dataset_accumulation_enabled(&self, enabled: bool) {
        self.session.set_dataset_accumulation_enabled(enabled);
    }

    /// 提交 RGBA 帧；未启用时返回 false
    #[frb(sync)]
    pub fn process_rgba_frame(
        &self,
        width: u32,
        height: u32,
        data: Vec<u8>,
        timestamp_ms: u64,
    ) -> Result<bool, HandSegApiError> {
        let frame = Frame::try_new(width, height, data, timestamp_ms, 0)?;
        self.submit(frame)
    }

    /// 提交相机 YUV420 帧
    #[frb(sync)]
    pub fn process_yuv_frame(&self, frame: RawFrame) -> Result<bool, HandSegApiError> {
        let frame = frame.to_rgba()?;
        self.submit(frame)
    }

    fn submit(&self, frame: Frame) -> Result<bool, HandSegApiError> {
        // set before scheduling; on_result moves it back to Ready
        let previous = self.tracker.set_state(ProcessingState::Processing);
        match self.session.submit_frame(frame) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.tracker.set_state(previous);
                Ok(false)
            }
            Err(e) => {
                // on_error has already moved the state to Error
                error!("❌ Frame rejected: {}", e);
                Err(e.into())
            }
        }
    }

    /// 会话开关状态
    #[frb(sync, getter)]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// 处理状态与检测统计
    #[frb(sync, getter)]
    pub fn snapshot(&self) -> ProcessingSnapshot {
        self.tracker.snapshot()
    }

    /// 已累积样本统计
    #[frb(sync, getter)]
    pub fn dataset_stats(&self) -> DatasetStats {
        self.session.dataset_stats()
    }

    /// 保存裁剪数据集，返回数据集目录
    #[frb]
    pub fn save_dataset(&self, label: Option<String>) -> Result<String, HandSegApiError> {
        let saved = self.session.save_dataset(label)?.wait()?;
        info!(
            "💾 HandSegmentation: {} images saved to {:?}",
            saved.images_written, saved.directory
        );
        Ok(saved.directory.to_string_lossy().into_owned())
    }

    /// 等待所有排队任务完成
    #[frb]
    pub fn wait_idle(&self) {
        self.session.wait_idle();
    }

    /// 释放会话资源
    #[frb(sync)]
    pub fn cleanup(&self) {
        self.session.cleanup();
        self.tracker.reset(ProcessingState::Idle);
    }

    /// Rust 侧宿主的回调（Dart 侧使用 snapshot 轮询）
    #[frb(ignore)]
    pub fn set_listener(&self, listener: Option<Arc<dyn SegmentationListener>>) {
        *self
            .tracker
            .forward
            .write()
            .unwrap_or_else(PoisonError::into_inner) = listener;
    }

    #[frb(ignore)]
    pub fn session(&self) -> &SessionManager {
        &self.session
    }
}

impl Drop for HandSegmentation {
    fn drop(&mut self) {
        info!("🗑️ HandSegmentation: released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::segmentation::engine::test_frames;
    use crate::core::segmentation::listener::{ChannelListener, SegmentationEvent};
    use std::thread;
    use std::time::Duration;

    fn create() -> (HandSegmentation, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let seg = HandSegmentation::create(
            temp.path().to_string_lossy().into_owned(),
            "s-001".to_string(),
        )
        .unwrap();
        (seg, temp)
    }

    fn submit_two_hands(seg: &HandSegmentation) -> bool {
        let frame = test_frames::two_hands();
        seg.process_rgba_frame(frame.width, frame.height, frame.data, 100)
            .unwrap()
    }

    #[test]
    fn test_create_starts_ready() {
        let (seg, temp) = create();
        let snapshot = seg.snapshot();
        assert_eq!(snapshot.state, ProcessingState::Ready);
        assert_eq!(snapshot.frames_processed, 0);
        assert_eq!(seg.state().current_session_id.as_deref(), Some("s-001"));
        assert!(temp
            .path()
            .join("sessions/s-001/hand_segmentation")
            .is_dir());
    }

    #[test]
    fn test_disabled_frames_are_not_submitted() {
        let (seg, _temp) = create();
        assert!(!submit_two_hands(&seg));
        assert_eq!(seg.snapshot().state, ProcessingState::Ready);
    }

    #[test]
    fn test_snapshot_tracks_detections() {
        let (seg, _temp) = create();
        seg.set_enabled(true);
        assert!(submit_two_hands(&seg));
        seg.wait_idle();

        let frame = Frame::filled(640, 480, test_frames::GRAY);
        seg.process_rgba_frame(640, 480, frame.data, 200).unwrap();
        seg.wait_idle();

        let snapshot = seg.snapshot();
        assert_eq!(snapshot.state, ProcessingState::Ready);
        assert_eq!(snapshot.frames_processed, 2);
        assert_eq!(snapshot.frames_with_hands, 1);
        assert_eq!(snapshot.last_detection_count, 0);
        assert!(snapshot.average_processing_ms >= 0.0);
    }

    #[test]
    fn test_turning_off_settles_cancelled_job() {
        let (seg, _temp) = create();
        seg.set_enabled(true);
        seg.session()
            .engine()
            .set_commit_stall(Some(Duration::from_millis(300)));

        assert!(submit_two_hands(&seg));
        thread::sleep(Duration::from_millis(50));
        seg.set_enabled(false);
        seg.wait_idle();

        let snapshot = seg.snapshot();
        assert_eq!(snapshot.state, ProcessingState::Ready);
        assert_eq!(snapshot.frames_processed, 0);

        seg.set_enabled(true);
        assert!(submit_two_hands(&seg));
        thread::sleep(Duration::from_millis(50));
        seg.set_real_time_processing(false);
        seg.wait_idle();
        seg.session().engine().set_commit_stall(None);

        assert_eq!(seg.snapshot().state, ProcessingState::Ready);
        assert_eq!(seg.snapshot().frames_processed, 0);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let (seg, _temp) = create();
        seg.set_enabled(true);
        let err = seg
            .process_rgba_frame(640, 480, vec![0; 16], 0)
            .unwrap_err();
        assert_eq!(err.error_type, "InvalidFrame");
    }

    #[test]
    fn test_yuv_frame_is_processed() {
        let (seg, _temp) = create();
        seg.set_enabled(true);
        let frame = RawFrame {
            width: 64,
            height: 48,
            y_plane: vec![128; 64 * 48],
            u_plane: vec![128; 32 * 24],
            v_plane: vec![128; 32 * 24],
            timestamp_ms: 5,
            frame_number: 1,
        };
        assert!(seg.process_yuv_frame(frame).unwrap());
        seg.wait_idle();
        assert_eq!(seg.snapshot().frames_processed, 1);
    }

    #[test]
    fn test_rolling_average_uses_last_window() {
        let mut inner = TrackerInner::new(ProcessingState::Ready);
        for ms in 0..40u64 {
            inner.record(&SegmentationResult::empty(ms));
        }
        let snapshot = inner.snapshot();
        assert_eq!(snapshot.frames_processed, 40);
        // mean of 10..=39
        assert!((snapshot.average_processing_ms - 24.5).abs() < 1e-9);
    }

    #[test]
    fn test_error_updates_state_and_forwards() {
        let (seg, _temp) = create();
        let (listener, events) = ChannelListener::new();
        seg.set_listener(Some(Arc::new(listener)));

        seg.tracker.on_error("decoder hiccup");
        let snapshot = seg.snapshot();
        assert_eq!(snapshot.state, ProcessingState::Error);
        assert_eq!(snapshot.last_error.as_deref(), Some("decoder hiccup"));
        assert!(matches!(events.try_recv(), Ok(SegmentationEvent::Error(_))));
    }

    #[test]
    fn test_save_dataset_returns_directory() {
        let (seg, _temp) = create();
        seg.set_enabled(true);
        seg.set_dataset_accumulation_enabled(true);
        submit_two_hands(&seg);
        seg.wait_idle();
        assert_eq!(seg.dataset_stats().total, 2);

        let dir = seg.save_dataset(Some("demo".to_string())).unwrap();
        assert!(dir.ends_with("cropped_dataset_demo"));
        assert!(Path::new(&dir).join("metadata.json").is_file());
    }

    #[test]
    fn test_empty_save_maps_to_no_data() {
        let (seg, _temp) = create();
        let err = seg.save_dataset(None).unwrap_err();
        assert_eq!(err.error_type, "NoData");
    }

    #[test]
    fn test_cleanup_then_new_session() {
        let (seg, _temp) = create();
        seg.cleanup();
        assert_eq!(seg.snapshot().state, ProcessingState::Idle);
        assert_eq!(
            seg.process_rgba_frame(1, 1, vec![0; 4], 0).unwrap_err().error_type,
            "NotInitialized"
        );
        let snapshot = seg.snapshot();
        assert_eq!(snapshot.state, ProcessingState::Error);
        assert_eq!(snapshot.last_error.as_deref(), Some("Engine not initialized"));

        let dir = seg.start_session("s-002".to_string()).unwrap();
        assert!(dir.ends_with("hand_segmentation"));
        seg.set_enabled(true);
        assert!(submit_two_hands(&seg));
        seg.wait_idle();
        assert_eq!(seg.snapshot().frames_processed, 1);
    }
}
