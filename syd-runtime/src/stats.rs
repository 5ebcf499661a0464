//! Per-worker statistics counters and cross-worker aggregation.
//!
//! Counters are plain fields mutated only by the owning worker. Snapshots are collected by
//! submitting a task to every worker that copies its counters into a slot indexed by worker id;
//! the aggregation helpers then run over the snapshot vector without synchronization.

use serde::Serialize;
use serde_json::{Value, json};

use syd_common::ids::WorkerId;

/// Counters kept by one worker, updated inline on the event loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatistics {
    /// Number of `wait` calls.
    pub n_polls: u64,
    /// Number of readiness events returned over all `wait` calls.
    pub n_pollev: u64,
    /// Largest event batch one `wait` call returned.
    pub evq_max: u64,
    /// Read events dispatched to handlers.
    pub n_read: u64,
    /// Write-ready events dispatched to handlers.
    pub n_write: u64,
    /// Error events dispatched to handlers.
    pub n_error: u64,
    /// Hangup events dispatched to handlers (including synthesized ones).
    pub n_hup: u64,
    /// Connections accepted from the shared listener set.
    pub n_accept: u64,
    /// Descriptors currently registered on this worker.
    pub n_fds: i64,
    /// Descriptors ever registered on this worker.
    pub total_fds: u64,
}

impl WorkerStatistics {
    /// Average readiness-event batch size, rounded down.
    #[must_use]
    pub fn evq_avg(&self) -> u64 {
        if self.n_polls == 0 {
            0
        } else {
            self.n_pollev / self.n_polls
        }
    }
}

/// Sums `field` over a snapshot vector.
pub fn sum<T, F>(stats: &[T], field: F) -> u64
where
    F: Fn(&T) -> u64,
{
    stats.iter().map(field).sum()
}

/// Largest `field` value over a snapshot vector; zero when empty.
pub fn max<T, F>(stats: &[T], field: F) -> u64
where
    F: Fn(&T) -> u64,
{
    stats.iter().map(field).max().unwrap_or(0)
}

/// Smallest `field` value over a snapshot vector; zero when empty.
pub fn min<T, F>(stats: &[T], field: F) -> u64
where
    F: Fn(&T) -> u64,
{
    stats.iter().map(field).min().unwrap_or(0)
}

/// Average `field` value over a snapshot vector, rounded down; zero when empty.
pub fn avg<T, F>(stats: &[T], field: F) -> u64
where
    F: Fn(&T) -> u64,
{
    if stats.is_empty() {
        0
    } else {
        sum(stats, field) / stats.len() as u64
    }
}

/// Pool-wide statistics rollup.
///
/// Descriptor counts are surfaced as three separate fields; collapsing sum, minimum and maximum
/// into a single field loses two of the three.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateStatistics {
    pub n_polls: u64,
    pub n_pollev: u64,
    pub evq_avg: u64,
    pub evq_max: u64,
    pub n_read: u64,
    pub n_write: u64,
    pub n_error: u64,
    pub n_hup: u64,
    pub n_accept: u64,
    pub n_fds_total: u64,
    pub n_fds_min: u64,
    pub n_fds_max: u64,
}

impl AggregateStatistics {
    /// Rolls one snapshot vector up into the pool-wide view.
    #[must_use]
    pub fn from_workers(stats: &[WorkerStatistics]) -> Self {
        Self {
            n_polls: sum(stats, |s| s.n_polls),
            n_pollev: sum(stats, |s| s.n_pollev),
            evq_avg: avg(stats, WorkerStatistics::evq_avg),
            evq_max: max(stats, |s| s.evq_max),
            n_read: sum(stats, |s| s.n_read),
            n_write: sum(stats, |s| s.n_write),
            n_error: sum(stats, |s| s.n_error),
            n_hup: sum(stats, |s| s.n_hup),
            n_accept: sum(stats, |s| s.n_accept),
            n_fds_total: sum(stats, |s| s.n_fds.max(0).unsigned_abs()),
            n_fds_min: min(stats, |s| s.n_fds.max(0).unsigned_abs()),
            n_fds_max: max(stats, |s| s.n_fds.max(0).unsigned_abs()),
        }
    }
}

/// JSON document describing one worker, in the shape the admin endpoint serves.
#[must_use]
pub fn worker_document(id: WorkerId, stats: &WorkerStatistics) -> Value {
    json!({
        "id": id.to_string(),
        "type": "threads",
        "attributes": {
            "stats": stats,
            "avg_event_queue_length": stats.evq_avg(),
            "current_descriptors": stats.n_fds,
            "total_descriptors": stats.total_fds,
        },
    })
}

/// JSON list document over all workers plus the aggregate rollup.
#[must_use]
pub fn pool_document(stats: &[WorkerStatistics]) -> Value {
    let data: Vec<Value> = stats
        .iter()
        .enumerate()
        .map(|(id, entry)| worker_document(id, entry))
        .collect();
    json!({
        "data": data,
        "aggregate": AggregateStatistics::from_workers(stats),
    })
}
