//! Generation-based cancellation for drop-and-replace frame scheduling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hands out tokens; issuing a new token cancels every earlier one.
#[derive(Debug, Clone, Default)]
pub struct CancellationGenerator {
    current: Arc<AtomicU64>,
}

impl CancellationGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supersedes all outstanding tokens and returns one for the new generation.
    pub fn next_token(&self) -> CancellationToken {
        let generation = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        CancellationToken {
            current: Arc::clone(&self.current),
            generation,
        }
    }

    /// Cancels all outstanding tokens without issuing a new one.
    pub fn cancel_all(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    pub fn generation(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct CancellationToken {
    current: Arc<AtomicU64>,
    generation: u64,
}

impl CancellationToken {
    /// A token that is only cancelled through its own [`CancellationToken::cancel`].
    pub fn standalone() -> Self {
        CancellationGenerator::new().next_token()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.current.load(Ordering::Acquire) != self.generation
    }

    /// Cancels this token and every other token of the same generator.
    pub fn cancel(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }
}
