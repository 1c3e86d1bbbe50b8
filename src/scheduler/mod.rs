//! Job dispatch: envelopes, the work queue and the worker pool.
//!
//! - **JobEnvelope**: one unit of work, bound to the fragment log it writes
//! - **WorkQueue**: at-least-once queue with leases and bounded retries
//!   (`RedisWorkQueue`, `MemoryWorkQueue`)
//! - **WorkerPool**: workers that generate into fragment logs, plus a reaper
//!   for deliveries whose worker went silent
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Gateway    │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐      reap_stalled     ┌────────┐
//!                      │  Work Queue  │ ◄──────────────────── │ Reaper │
//!                      └──────┬───────┘                       └────────┘
//!                             │ claim (one consumer per envelope)
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│ ──► fragment logs
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fragment_relay::fragment::{LogRetention, RedisLogStore};
//! use fragment_relay::llm::{EchoEngine, EngineRegistry};
//! use fragment_relay::scheduler::{QueueConfig, RedisWorkQueue, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(RedisWorkQueue::connect("redis://localhost:6379", QueueConfig::default()).await?);
//! let store = Arc::new(RedisLogStore::connect("redis://localhost:6379").await?);
//! let engines = Arc::new(EngineRegistry::serving_all(Arc::new(EchoEngine::new())));
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::default(), queue, store, engines, LogRetention::default());
//! pool.start().await?;
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic claim**: a Lua script moves the envelope to the processing list
//!   and records its lease in one step
//! - **Redelivery**: a failed attempt is re-queued as a new job with a new log
//! - **Dead letter queue**: envelopes that exhaust their attempts are kept for analysis
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod job;
pub mod memory_queue;
pub mod queue;
pub mod redis_queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use job::{JobEnvelope, JobPhase, LogAddress, ModelSelector, DEFAULT_LOG_PREFIX, DEFAULT_MAX_ATTEMPTS};
pub use memory_queue::MemoryWorkQueue;
pub use queue::{
    DeadLetterEntry, Delivery, FailOutcome, QueueConfig, QueueError, QueueStats, WorkQueue,
    DEFAULT_DEAD_LETTER_LIMIT, DEFAULT_QUEUE_NAME,
};
pub use redis_queue::RedisWorkQueue;
pub use worker_pool::{PoolError, PoolStats, StallReaper, WorkerPool, WorkerPoolConfig};
