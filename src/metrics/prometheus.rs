//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by fragment-relay and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all fragment-relay metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs accepted by the gateway, labeled by model.
pub static JOBS_SUBMITTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs finished by workers, labeled by outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job duration in seconds from claim to terminal, labeled by model.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Fragment records appended across all logs.
pub static FRAGMENTS_APPENDED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Terminal sentinels written, labeled by outcome.
pub static TERMINALS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Envelopes redelivered after a failed attempt.
pub static REDELIVERIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Envelopes moved to the dead letter list.
pub static DEAD_LETTERS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Abandoned logs sealed with an error terminal by the stall reaper.
pub static ORPHANS_SEALED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Reader exits, labeled by reason.
pub static READER_EXITS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Sequence gaps observed by readers.
pub static FRAGMENT_GAPS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Number of envelopes in the queue, labeled by queue name and state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being generated.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Number of attached readers.
pub static ACTIVE_VIEWERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording through [`super::MetricsCollector`] is a
/// no-op until this has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_submitted_total = CounterVec::new(
        Opts::new(
            "fragment_relay_jobs_submitted_total",
            "Jobs accepted by the gateway",
        ),
        &["model"],
    )?;

    let jobs_total = CounterVec::new(
        Opts::new("fragment_relay_jobs_total", "Jobs finished by workers"),
        &["outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "fragment_relay_job_duration_seconds",
            "Job duration from claim to terminal in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["model"],
    )?;

    // Log metrics
    let fragments_appended_total = Counter::new(
        "fragment_relay_fragments_appended_total",
        "Fragment records appended",
    )?;

    let terminals_total = CounterVec::new(
        Opts::new(
            "fragment_relay_terminals_total",
            "Terminal sentinels written",
        ),
        &["outcome"],
    )?;

    // Queue metrics
    let redeliveries_total = Counter::new(
        "fragment_relay_redeliveries_total",
        "Envelopes redelivered after a failed attempt",
    )?;

    let dead_letters_total = Counter::new(
        "fragment_relay_dead_letters_total",
        "Envelopes moved to the dead letter list",
    )?;

    let orphans_sealed_total = Counter::new(
        "fragment_relay_orphans_sealed_total",
        "Abandoned logs sealed by the stall reaper",
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("fragment_relay_queue_depth", "Number of envelopes in queue"),
        &["queue_name", "state"],
    )?;

    // Reader metrics
    let reader_exits_total = CounterVec::new(
        Opts::new("fragment_relay_reader_exits_total", "Reader exits by reason"),
        &["reason"],
    )?;

    let fragment_gaps_total = Counter::new(
        "fragment_relay_fragment_gaps_total",
        "Sequence gaps observed by readers",
    )?;

    let active_viewers = Gauge::new("fragment_relay_active_viewers", "Attached readers")?;

    // Worker metrics
    let jobs_in_progress = Gauge::new(
        "fragment_relay_jobs_in_progress",
        "Number of jobs currently being generated",
    )?;

    let active_workers = Gauge::new("fragment_relay_active_workers", "Number of running workers")?;

    registry.register(Box::new(jobs_submitted_total.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(fragments_appended_total.clone()))?;
    registry.register(Box::new(terminals_total.clone()))?;
    registry.register(Box::new(redeliveries_total.clone()))?;
    registry.register(Box::new(dead_letters_total.clone()))?;
    registry.register(Box::new(orphans_sealed_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(reader_exits_total.clone()))?;
    registry.register(Box::new(fragment_gaps_total.clone()))?;
    registry.register(Box::new(active_viewers.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_SUBMITTED_TOTAL.set(jobs_submitted_total);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = FRAGMENTS_APPENDED_TOTAL.set(fragments_appended_total);
    let _ = TERMINALS_TOTAL.set(terminals_total);
    let _ = REDELIVERIES_TOTAL.set(redeliveries_total);
    let _ = DEAD_LETTERS_TOTAL.set(dead_letters_total);
    let _ = ORPHANS_SEALED_TOTAL.set(orphans_sealed_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = READER_EXITS_TOTAL.set(reader_exits_total);
    let _ = FRAGMENT_GAPS_TOTAL.set(fragment_gaps_total);
    let _ = ACTIVE_VIEWERS.set(active_viewers);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the current exposition to `path` for a node-exporter textfile
/// collector. The file is replaced atomically via a temporary sibling.
pub async fn write_metrics_file(path: &std::path::Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, export_metrics()).await?;
    tokio::fs::rename(&tmp, path).await
}
