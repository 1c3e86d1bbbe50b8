//! Per-job fragment logs: the storage, the single writer, and the readers.
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────┐   append + expire    ┌──────────────┐   read_after   ┌──────────┐
//!    │ Producer │ ───────────────────► │ Fragment Log │ ◄───────────── │ Reader 1 │
//!    │ (worker) │   terminal (once)    │  (LogStore)  │ ◄───────────── │ Reader N │
//!    └──────────┘                      └──────────────┘                └──────────┘
//! ```
//!
//! - **LogStore**: append-only ordered records with per-key expiry
//!   (`RedisLogStore` for production, `MemoryLogStore` in process)
//! - **FragmentProducer**: appends fragments, refreshes TTL, writes one terminal
//! - **FragmentReader**: pre-checks, replays, tails until terminal or idle timeout
//! - **ViewerRegistry**: tracks attached readers, released on drop
//!
//! # Retention
//!
//! Nothing deletes logs explicitly. Every append resets the key's TTL to
//! the live retention; an error terminal shortens it. Readers have no
//! influence on either.

pub mod memory_store;
pub mod producer;
pub mod reader;
pub mod record;
pub mod redis_store;
pub mod store;
pub mod viewers;

pub use memory_store::MemoryLogStore;
pub use producer::{seal_abandoned, FragmentProducer, LogRetention, ProduceSummary, RetentionError};
pub use reader::{FragmentReader, FragmentTail, ReaderConfig};
pub use record::{Cursor, FragmentRecord, NewRecord, Outcome, RecordBody, RecordId};
pub use redis_store::RedisLogStore;
pub use store::{LogState, LogStore};
pub use viewers::{ViewerGuard, ViewerInfo, ViewerRegistry};
