pub mod cancel;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod frame;
pub mod listener;
pub mod persist;
pub mod region;
pub mod render;
pub mod session;
pub mod skin;
pub mod video;

pub use cancel::{CancellationGenerator, CancellationToken};
pub use dataset::{CroppedSample, DatasetAccumulator, DatasetStats};
pub use engine::{EngineConfig, SegmentationEngine, SegmentationResult};
pub use error::SegmentationError;
pub use frame::{Frame, RawFrame};
pub use listener::{ChannelListener, SegmentationEvent, SegmentationListener};
pub use persist::{DatasetMetadata, DatasetPersister, SavedDataset};
pub use region::{BoundingBox, HandRegion, HandType, RegionExtractor};
pub use render::FrameRenderer;
pub use session::{BackgroundTask, Lifecycle, SessionConfig, SessionManager, SessionState};
pub use skin::{SkinMask, SkinMaskClassifier, SkinThresholds};
pub use video::{VideoDecoder, VideoFrameSource, VideoProcessingReport, VideoSampling};
