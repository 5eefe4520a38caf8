use thiserror::Error;

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("Engine not initialized")]
    NotInitialized,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image encode error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Metadata serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame extraction failed at {timestamp_ms}ms: {reason}")]
    Decode { timestamp_ms: u64, reason: String },
    #[error("Frame processing failed: {0}")]
    Processing(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("No cropped samples to save")]
    NoData,
    #[error("Invalid name {0:?}: must be a single path component")]
    InvalidName(String),
    #[error("Background task dropped before completion")]
    TaskDropped,
    #[error("No video decoder configured")]
    NoVideoDecoder,
    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, SegmentationError>;
