//! Daemon-wide Prometheus metrics.
//!
//! Grouped into one struct rather than scattered globals, built directly
//! on `prometheus`'s own `register_*!` macros since nothing here needs
//! per-label-set dynamic registration beyond what `prometheus` already
//! provides.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec,
};

pub struct DaemonMetrics {
    /// Number of dirty buffers currently held by the block cache.
    pub dirty_buffer_count: IntGauge,
    /// Free chunks remaining per allocator space, labeled `space`.
    pub free_chunks: IntGaugeVec,
    /// Total journal transactions committed.
    pub journal_commits: IntCounter,
    /// Total journal recovery runs performed at startup.
    pub journal_recoveries: IntCounter,
    /// Total exceptions inserted into the B-tree, labeled `origin` or
    /// `snapshot`.
    pub exceptions_created: IntCounterVec,
    /// Total pressure-driven snapshot evictions.
    pub pressure_evictions: IntCounter,
    /// Total chunks copied out by the copyout engine.
    pub chunks_copied: IntCounter,
    /// Currently active snap-read locks.
    pub active_read_locks: IntGauge,
    /// Requests served, labeled by wire message code name.
    pub requests_total: IntCounterVec,
}

impl DaemonMetrics {
    fn new() -> Self {
        Self {
            dirty_buffer_count: register_int_gauge!(
                "chunksnap_dirty_buffer_count",
                "Number of dirty metadata buffers held by the block cache"
            )
            .unwrap(),
            free_chunks: register_int_gauge_vec!(
                "chunksnap_free_chunks",
                "Free chunks remaining in an allocator space",
                &["space"]
            )
            .unwrap(),
            journal_commits: register_int_counter!(
                "chunksnap_journal_commits_total",
                "Number of journal transactions committed"
            )
            .unwrap(),
            journal_recoveries: register_int_counter!(
                "chunksnap_journal_recoveries_total",
                "Number of journal recovery passes run at startup"
            )
            .unwrap(),
            exceptions_created: register_int_counter_vec!(
                "chunksnap_exceptions_created_total",
                "Exception records inserted into the B-tree",
                &["writer"]
            )
            .unwrap(),
            pressure_evictions: register_int_counter!(
                "chunksnap_pressure_evictions_total",
                "Snapshots evicted under snapshot-data allocation pressure"
            )
            .unwrap(),
            chunks_copied: register_int_counter!(
                "chunksnap_chunks_copied_total",
                "Chunks copied out by the copyout engine"
            )
            .unwrap(),
            active_read_locks: register_int_gauge!(
                "chunksnap_active_read_locks",
                "Snap-read locks currently held on origin chunks"
            )
            .unwrap(),
            requests_total: register_int_counter_vec!(
                "chunksnap_requests_total",
                "Requests served by message code",
                &["code"]
            )
            .unwrap(),
        }
    }
}

pub static METRICS: Lazy<DaemonMetrics> = Lazy::new(DaemonMetrics::new);
