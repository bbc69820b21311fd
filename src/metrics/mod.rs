//! Engine counters
//!
//! Lock-free counters updated by the lifecycle manager, connection cache and
//! reconciliation loop, exposed as a JSON snapshot on `/api/v1/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters shared across engine components
pub struct EngineMetrics {
    started_at: DateTime<Utc>,

    // Connection cache
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    channels_evicted: AtomicU64,

    // Lifecycle
    deployments_started: AtomicU64,
    deployments_succeeded: AtomicU64,
    deployments_failed: AtomicU64,
    undeployments: AtomicU64,
    orphans_adopted: AtomicU64,

    // Reconciliation
    reconcile_passes: AtomicU64,
    zombies_removed: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            channels_evicted: AtomicU64::new(0),
            deployments_started: AtomicU64::new(0),
            deployments_succeeded: AtomicU64::new(0),
            deployments_failed: AtomicU64::new(0),
            undeployments: AtomicU64::new(0),
            orphans_adopted: AtomicU64::new(0),
            reconcile_passes: AtomicU64::new(0),
            zombies_removed: AtomicU64::new(0),
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_evicted(&self) {
        self.channels_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deploy_started(&self) {
        self.deployments_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deploy_succeeded(&self) {
        self.deployments_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deploy_failed(&self) {
        self.deployments_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_undeploy(&self) {
        self.undeployments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orphan_adopted(&self) {
        self.orphans_adopted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconcile_pass(&self) {
        self.reconcile_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zombies_removed(&self, count: u64) {
        self.zombies_removed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            channels_evicted: self.channels_evicted.load(Ordering::Relaxed),
            deployments_started: self.deployments_started.load(Ordering::Relaxed),
            deployments_succeeded: self.deployments_succeeded.load(Ordering::Relaxed),
            deployments_failed: self.deployments_failed.load(Ordering::Relaxed),
            undeployments: self.undeployments.load(Ordering::Relaxed),
            orphans_adopted: self.orphans_adopted.load(Ordering::Relaxed),
            reconcile_passes: self.reconcile_passes.load(Ordering::Relaxed),
            zombies_removed: self.zombies_removed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub channels_evicted: u64,
    pub deployments_started: u64,
    pub deployments_succeeded: u64,
    pub deployments_failed: u64,
    pub undeployments: u64,
    pub orphans_adopted: u64,
    pub reconcile_passes: u64,
    pub zombies_removed: u64,
}

impl MetricsSnapshot {
    /// Fraction of resolutions served from an existing channel
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
