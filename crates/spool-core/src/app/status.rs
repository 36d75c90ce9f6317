//! Status - サービスの観測用ビュー

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::config::ConsumeType;

/// Counters updated by the service and its workers.
#[derive(Debug, Default)]
pub struct ServiceStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
}

impl ServiceStats {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finished(&self, n: u64) {
        self.finished.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Handler calls made in batch mode.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

/// Point-in-time counters and queue depth of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    pub queued: usize,
    pub capacity: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub finished: u64,
    pub failed: u64,
    pub batches: u64,
}

/// Static description of a service, logged at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub interface: String,
    pub handler: String,
    pub consume_type: ConsumeType,
    pub consume_worker: usize,
    pub qps: u32,
    pub max_batch_size: usize,
    pub queue_capacity: usize,
}
