//! Concurrency planning and the encoder slot pool.
//!
//! The plan decides how many encoder processes may run at once; the slot pool
//! enforces it. Each admitted job holds a numbered slot until its guard is
//! dropped, which frees the slot for the next admission.

use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use vidshrink_config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of concurrent encoder processes
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// An explicit `max_concurrent_jobs` wins. Zero means auto: one encoder
    /// per eight logical cores, between 1 and 4.
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .scheduler
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32);

        let max_concurrent_jobs = if cfg.scheduler.max_concurrent_jobs > 0 {
            cfg.scheduler.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

fn derive_max_jobs(cores: u32) -> u32 {
    (cores / 8).clamp(1, 4)
}

/// Fixed-size pool of numbered encoder slots.
#[derive(Debug, Clone)]
pub struct WorkerSlots {
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<usize>>>,
    capacity: usize,
}

impl WorkerSlots {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            // Popped from the back, so slot 0 is handed out first
            free: Arc::new(Mutex::new((0..capacity).rev().collect())),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Option<SlotGuard> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        let slot = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or(0);
        Some(SlotGuard {
            slot,
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }
}

/// An occupied slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    slot: usize,
    free: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // The slot number goes back before the permit is released
        if let Ok(mut free) = self.free.lock() {
            free.push(self.slot);
        }
    }
}
