//! Recorded-video post-processing driven through an external frame decoder.

use std::fs;
use std::path::{Path, PathBuf};

use image::{ColorType, ImageFormat};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::cancel::CancellationToken;
use super::engine::SegmentationEngine;
use super::error::{Result, SegmentationError};
use super::frame::Frame;

pub const DEFAULT_TARGET_FPS: u32 = 10;
/// Upper bound on frames pulled from one video.
pub const MAX_EXTRACTED_FRAMES: usize = 100;

/// Seekable frame access to one opened video.
pub trait VideoFrameSource: Send {
    fn duration_ms(&self) -> u64;

    /// Frame nearest to `timestamp_ms`.
    fn frame_at(&mut self, timestamp_ms: u64) -> Result<Frame>;
}

/// Platform media decoder supplied by the host.
pub trait VideoDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoFrameSource>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSampling {
    pub target_fps: u32,
    pub max_frames: usize,
}

impl Default for VideoSampling {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            max_frames: MAX_EXTRACTED_FRAMES,
        }
    }
}

impl VideoSampling {
    pub fn step_ms(&self) -> u64 {
        (1000 / self.target_fps.max(1) as u64).max(1)
    }

    /// Sample timestamps below `duration_ms`, never more than the frame cap.
    pub fn timestamps(&self, duration_ms: u64) -> impl Iterator<Item = u64> {
        let step = self.step_ms();
        let limit = self.max_frames.min(MAX_EXTRACTED_FRAMES);
        (0..)
            .map(move |i: u64| i * step)
            .take_while(move |&t| t < duration_ms)
            .take(limit)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoProcessingReport {
    pub requested: usize,
    pub extracted: usize,
    pub failed: usize,
    pub frames_with_hands: usize,
    pub total_hands: usize,
    pub frames_dir: PathBuf,
}

/// Steps through the video at the sampling rate, saves each extracted frame under
/// `frames_dir` and feeds it to the engine. Stops early once `token` is cancelled.
pub fn process_video(
    engine: &SegmentationEngine,
    decoder: &dyn VideoDecoder,
    video_path: &Path,
    sampling: VideoSampling,
    frames_dir: &Path,
    token: &CancellationToken,
) -> Result<VideoProcessingReport> {
    if !engine.is_initialized() {
        return Err(SegmentationError::NotInitialized);
    }

    let mut source = decoder.open(video_path)?;
    let duration_ms = source.duration_ms();
    fs::create_dir_all(frames_dir)?;

    info!(
        "🎬 Post-processing {:?}: {}ms at {} fps",
        video_path, duration_ms, sampling.target_fps
    );

    let mut report = VideoProcessingReport {
        frames_dir: frames_dir.to_path_buf(),
        ..Default::default()
    };

    for timestamp_ms in sampling.timestamps(duration_ms) {
        if token.is_cancelled() {
            info!("⏹️ Video post-processing cancelled at {}ms", timestamp_ms);
            break;
        }
        report.requested += 1;

        let frame = match source.frame_at(timestamp_ms) {
            Ok(frame) => frame,
            Err(e) => {
                let e = if matches!(e, SegmentationError::Decode { .. }) {
                    e
                } else {
                    SegmentationError::Decode {
                        timestamp_ms,
                        reason: e.to_string(),
                    }
                };
                warn!("⚠️ {}", e);
                engine.report_error(&e.to_string());
                report.failed += 1;
                continue;
            }
        };

        let index = report.extracted;
        report.extracted += 1;
        let frame_path = frames_dir.join(format!("frame_{:04}_{}.png", index, timestamp_ms));
        if let Err(e) = write_frame(&frame, &frame_path) {
            warn!("⚠️ Failed to write extracted frame {:?}: {}", frame_path, e);
        }

        let result = engine.process_frame(&frame, timestamp_ms)?;
        if result.has_hands() {
            report.frames_with_hands += 1;
            report.total_hands += result.detected_hands.len();
        }
    }

    info!(
        "✅ Video post-processing done: {} extracted, {} failed, {} with hands",
        report.extracted, report.failed, report.frames_with_hands
    );
    Ok(report)
}

fn write_frame(frame: &Frame, path: &Path) -> Result<()> {
    frame.validate()?;
    image::save_buffer_with_format(
        path,
        &frame.data,
        frame.width,
        frame.height,
        ColorType::Rgba8,
        ImageFormat::Png,
    )?;
    Ok(())
}
