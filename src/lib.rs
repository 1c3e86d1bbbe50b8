//! fragment-relay: durable job dispatch with streamed, replayable output.
//!
//! A submission becomes a job on a work queue. A worker runs the job against
//! a generation engine and appends every fragment to a per-job log that
//! expires on its own. Any number of readers can attach to that log at any
//! time, replay what was written so far and follow it until the terminal
//! record.
//!
//! - [`gateway`]: validates submissions and enqueues envelopes
//! - [`scheduler`]: envelopes, work queues and the worker pool
//! - [`fragment`]: log storage, the producer and readers
//! - [`llm`]: generation engines
//! - [`storage`]: conversation ownership
//! - [`metrics`]: Prometheus counters and gauges

pub mod cli;
pub mod error;
pub mod fragment;
pub mod gateway;
pub mod llm;
pub mod metrics;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{EngineError, LogError, ProduceError, ReadError, SubmitError};
