//! Metric recording facade for relay operations.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so call sites never
//! deal with label ordering or uninitialized registries.

use super::prometheus::{
    ACTIVE_VIEWERS, ACTIVE_WORKERS, DEAD_LETTERS_TOTAL, FRAGMENTS_APPENDED_TOTAL,
    FRAGMENT_GAPS_TOTAL, JOBS_IN_PROGRESS, JOBS_SUBMITTED_TOTAL, JOBS_TOTAL, JOB_DURATION,
    ORPHANS_SEALED_TOTAL, QUEUE_DEPTH, READER_EXITS_TOTAL, REDELIVERIES_TOTAL, TERMINALS_TOTAL,
};
use crate::fragment::record::Outcome;
use crate::scheduler::job::ModelSelector;
use crate::scheduler::queue::QueueStats;

/// Metrics collector for recording relay operational metrics.
///
/// Every method is a no-op until [`super::init_metrics`] has run, so
/// library users that never export metrics pay nothing beyond a
/// `OnceLock` load.
///
/// # Example
///
/// ```ignore
/// use fragment_relay::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_fragment_appended();
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a job accepted by the gateway.
    pub fn record_submission(&self, model: ModelSelector) {
        if let Some(submitted) = JOBS_SUBMITTED_TOTAL.get() {
            submitted.with_label_values(&[model.as_str()]).inc();
        }
    }

    /// Record a finished job run.
    ///
    /// `outcome` is one of `completed`, `failed` or `lease_lost`.
    pub fn record_job(&self, model: ModelSelector, outcome: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[model.as_str()])
                .observe(duration_secs);
        }

        tracing::trace!(
            model = %model,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    pub fn record_fragment_appended(&self) {
        if let Some(appended) = FRAGMENTS_APPENDED_TOTAL.get() {
            appended.inc();
        }
    }

    pub fn record_terminal(&self, outcome: Outcome) {
        if let Some(terminals) = TERMINALS_TOTAL.get() {
            terminals.with_label_values(&[outcome.as_str()]).inc();
        }
    }

    pub fn record_redelivery(&self) {
        if let Some(redeliveries) = REDELIVERIES_TOTAL.get() {
            redeliveries.inc();
        }
    }

    pub fn record_dead_letter(&self) {
        if let Some(dead_letters) = DEAD_LETTERS_TOTAL.get() {
            dead_letters.inc();
        }
    }

    pub fn record_orphan_sealed(&self) {
        if let Some(sealed) = ORPHANS_SEALED_TOTAL.get() {
            sealed.inc();
        }
    }

    /// Record why a reader stopped (`terminal`, `idle_timeout`, ...).
    pub fn record_reader_exit(&self, reason: &str) {
        if let Some(exits) = READER_EXITS_TOTAL.get() {
            exits.with_label_values(&[reason]).inc();
        }

        tracing::trace!(reason = reason, "Recorded reader exit metric");
    }

    pub fn record_gap(&self) {
        if let Some(gaps) = FRAGMENT_GAPS_TOTAL.get() {
            gaps.inc();
        }
    }

    /// Update the queue depth gauges from a stats snapshot.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            let name = stats.queue_name.as_str();
            queue_depth
                .with_label_values(&[name, "pending"])
                .set(stats.pending_jobs as f64);
            queue_depth
                .with_label_values(&[name, "processing"])
                .set(stats.processing_jobs as f64);
            queue_depth
                .with_label_values(&[name, "dead_letter"])
                .set(stats.dead_letter_jobs as f64);
        }

        tracing::trace!(
            queue_name = %stats.queue_name,
            pending = stats.pending_jobs,
            processing = stats.processing_jobs,
            "Updated queue depth metric"
        );
    }

    /// Update the count of running workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    /// Update the count of attached readers.
    pub fn update_viewers(&self, count: usize) {
        if let Some(active_viewers) = ACTIVE_VIEWERS.get() {
            active_viewers.set(count as f64);
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
