//! Live scanning counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time copy of the scanner counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanningStatistics {
    pub check_queue_size: usize,
    pub blacklisted_ips: u64,
    pub non_blacklisted_ips: u64,
    pub active_workers: usize,
    pub duplicate_skips: u64,
}

/// Shared counters, updated by workers and schedulers without locking
#[derive(Debug, Default)]
pub struct ScanCounters {
    blacklisted: AtomicU64,
    non_blacklisted: AtomicU64,
    active_workers: AtomicUsize,
    duplicate_skips: AtomicU64,
}

impl ScanCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blacklisted(&self) {
        self.blacklisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) {
        self.non_blacklisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_skipped(&self) {
        self.duplicate_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Queue depth is read from the queue itself at snapshot time
    pub fn snapshot(&self, check_queue_size: usize) -> ScanningStatistics {
        ScanningStatistics {
            check_queue_size,
            blacklisted_ips: self.blacklisted.load(Ordering::Relaxed),
            non_blacklisted_ips: self.non_blacklisted.load(Ordering::Relaxed),
            active_workers: self.active_workers(),
            duplicate_skips: self.duplicate_skips.load(Ordering::Relaxed),
        }
    }
}
