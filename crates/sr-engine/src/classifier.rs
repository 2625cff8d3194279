//! Failure classification: task-local versus batch-fatal.

use std::error::Error as StdError;
use std::io;

use serde::{Deserialize, Serialize};

use sr_types::SearchError;

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Fails only the variant that hit it.
    TaskLocal,
    /// Aborts the whole batch.
    BatchFatal,
}

/// Walks the full cause chain and reports whether any link is resource
/// exhaustion or cluster unavailability.
pub fn is_batch_fatal(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(search) = err.downcast_ref::<SearchError>() {
            if search.is_resource_exhaustion() {
                return true;
            }
        }
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if io.kind() == io::ErrorKind::OutOfMemory {
                return true;
            }
        }
        current = err.source();
    }
    false
}

pub fn classify(error: &(dyn StdError + 'static)) -> FailureClass {
    if is_batch_fatal(error) {
        FailureClass::BatchFatal
    } else {
        FailureClass::TaskLocal
    }
}
