//! Concurrency gate: non-blocking admission bounding in-flight tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Fixed-capacity admission control shared by every batch of a task manager.
///
/// Admission never waits: [`ConcurrencyGate::try_admit`] either hands out an
/// [`AdmissionPermit`] or returns `None`. Dropping the permit releases the
/// slot, so every admission is matched by exactly one release whichever way
/// the task ends.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        let current = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::AcqRel);
        trace!(in_flight = current, max = self.max_concurrent, "task admitted");

        Some(AdmissionPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously admitted tasks seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }
}

/// One admitted slot. Released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        // Counter goes down before the semaphore slot is returned, so
        // in_flight never exceeds max_concurrent.
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
