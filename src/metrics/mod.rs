//! Metrics module for Prometheus-based monitoring.
//!
//! Covers the whole relay path: submissions, worker outcomes, log appends
//! and terminals, queue depth, and reader exits.
//!
//! # Example
//!
//! ```ignore
//! use fragment_relay::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_fragment_appended();
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_metrics_file};

pub use prometheus::{
    ACTIVE_VIEWERS, ACTIVE_WORKERS, DEAD_LETTERS_TOTAL, FRAGMENTS_APPENDED_TOTAL,
    FRAGMENT_GAPS_TOTAL, JOBS_IN_PROGRESS, JOBS_SUBMITTED_TOTAL, JOBS_TOTAL, JOB_DURATION,
    ORPHANS_SEALED_TOTAL, QUEUE_DEPTH, READER_EXITS_TOTAL, REDELIVERIES_TOTAL, REGISTRY,
    TERMINALS_TOTAL,
};
