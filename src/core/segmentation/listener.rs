//! Result callbacks emitted by the engine and the session manager.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use super::engine::SegmentationResult;

/// Receives engine events. Called from worker threads; implementations hop to their own
/// executor if they need one.
pub trait SegmentationListener: Send + Sync {
    fn on_detection(&self, _region_count: usize) {}

    fn on_result(&self, _result: &SegmentationResult) {}

    fn on_dataset_progress(&self, _total: usize, _left: usize, _right: usize) {}

    fn on_dataset_saved(&self, _path: &Path, _total: usize) {}

    fn on_error(&self, _message: &str) {}
}

#[derive(Debug, Clone)]
pub enum SegmentationEvent {
    Detection(usize),
    Result(SegmentationResult),
    DatasetProgress {
        total: usize,
        left: usize,
        right: usize,
    },
    DatasetSaved {
        path: PathBuf,
        total: usize,
    },
    Error(String),
}

/// Forwards every callback as a [`SegmentationEvent`] over an mpsc channel.
pub struct ChannelListener {
    sender: Mutex<Sender<SegmentationEvent>>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<SegmentationEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }

    fn send(&self, event: SegmentationEvent) {
        // receiver gone means nobody is listening anymore
        if let Ok(sender) = self.sender.lock() {
            sender.send(event).ok();
        }
    }
}

impl SegmentationListener for ChannelListener {
    fn on_detection(&self, region_count: usize) {
        self.send(SegmentationEvent::Detection(region_count));
    }

    fn on_result(&self, result: &SegmentationResult) {
        self.send(SegmentationEvent::Result(result.clone()));
    }

    fn on_dataset_progress(&self, total: usize, left: usize, right: usize) {
        self.send(SegmentationEvent::DatasetProgress { total, left, right });
    }

    fn on_dataset_saved(&self, path: &Path, total: usize) {
        self.send(SegmentationEvent::DatasetSaved {
            path: path.to_path_buf(),
            total,
        });
    }

    fn on_error(&self, message: &str) {
        self.send(SegmentationEvent::Error(message.to_string()));
    }
}
