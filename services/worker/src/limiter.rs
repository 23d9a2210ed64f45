//! Runtime-adjustable concurrency ceiling.
//!
//! Built on a tokio [`Semaphore`]. Growing the ceiling adds permits, which
//! wakes waiters immediately. Shrinking forgets idle permits; whatever cannot
//! be forgotten right away because it is held by in-flight work becomes a
//! deficit, paid off as those slots are released. In-flight work is never
//! cancelled.
//!
//! The ceiling and the deficit share one lock; a released slot settles
//! against the deficit under it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::info;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LimiterError {
    #[error("concurrency ceiling must be at least 1, got {0}")]
    InvalidCeiling(i64),

    #[error("limiter closed")]
    Closed,
}

#[derive(Debug)]
struct Bounds {
    ceiling: usize,
    /// Permits still to be retired as in-flight slots are released
    deficit: usize,
}

/// Counting admission primitive sized to the current ceiling
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    bounds: Arc<Mutex<Bounds>>,
    outstanding: Arc<AtomicUsize>,
}

/// A held slot; dropping it releases the slot
#[derive(Debug)]
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    bounds: Arc<Mutex<Bounds>>,
    outstanding: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        let Some(permit) = self.permit.take() else {
            return;
        };
        let mut bounds = self.bounds.lock();
        if bounds.deficit > 0 {
            bounds.deficit -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
    }
}

impl ConcurrencyLimiter {
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            bounds: Arc::new(Mutex::new(Bounds { ceiling, deficit: 0 })),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait until a slot is free
    pub async fn acquire(&self) -> Result<Slot, LimiterError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;
        Ok(self.slot(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<Slot> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.slot(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    fn slot(&self, permit: OwnedSemaphorePermit) -> Slot {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Slot {
            permit: Some(permit),
            bounds: self.bounds.clone(),
            outstanding: self.outstanding.clone(),
        }
    }

    /// Current ceiling
    pub fn ceiling(&self) -> usize {
        self.bounds.lock().ceiling
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Slots that can be acquired without waiting
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Change the ceiling, returning the previous value
    pub fn set_ceiling(&self, requested: i64) -> Result<usize, LimiterError> {
        if requested < 1 {
            return Err(LimiterError::InvalidCeiling(requested));
        }
        let new = usize::try_from(requested)
            .unwrap_or(usize::MAX)
            .min(Semaphore::MAX_PERMITS);

        let mut bounds = self.bounds.lock();
        let old = bounds.ceiling;

        if new > old {
            // Cancel outstanding debt before handing out new permits
            let grow = new - old;
            let settled = grow.min(bounds.deficit);
            bounds.deficit -= settled;
            self.semaphore.add_permits(grow - settled);
        } else if new < old {
            let shrink = old - new;
            let forgotten = self.semaphore.forget_permits(shrink);
            bounds.deficit += shrink - forgotten;
        }

        bounds.ceiling = new;
        drop(bounds);
        info!(previous = old, ceiling = new, "Concurrency ceiling updated");
        Ok(old)
    }
}
