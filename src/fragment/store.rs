//! Storage boundary for fragment logs.
//!
//! A backend provides an atomic per-record append that assigns ids and
//! sets the key's expiry in the same step, a bounded-wait read after a
//! given id, and idempotent per-key expiry. Both the producer and readers
//! go through this trait; neither knows which backend is in use.
//!
//! Appends are fenced. A log whose newest record is a terminal accepts
//! nothing more ([`LogError::Sealed`]), and a record must carry the
//! sequence right after the newest one ([`LogError::OutOfSequence`]). A
//! log with no records accepts any sequence.

use std::time::Duration;

use async_trait::async_trait;

use super::record::{Cursor, FragmentRecord, NewRecord, RecordId};
use crate::error::LogError;
use crate::scheduler::job::LogAddress;

/// Existence and size of a log, as seen by the reader pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// No log has ever been written at the address, or it has expired.
    Missing,
    /// The key exists but holds no records.
    Empty,
    /// The log holds this many records.
    Populated(usize),
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Appends one record, resets the log to expire `ttl` from now, and
    /// returns the id the store assigned. Both happen or neither does.
    ///
    /// Ids are strictly increasing within a log.
    async fn append(
        &self,
        address: &LogAddress,
        record: NewRecord,
        ttl: Duration,
    ) -> Result<RecordId, LogError>;

    /// Returns up to `limit` records after `after`, in id order.
    ///
    /// Waits at most `max_wait` for something to arrive; an empty vector
    /// means nothing did.
    async fn read_after(
        &self,
        address: &LogAddress,
        after: Cursor,
        max_wait: Duration,
        limit: usize,
    ) -> Result<Vec<FragmentRecord>, LogError>;

    /// Sets the log to expire `ttl` from now. Repeated calls reset the clock.
    async fn expire(&self, address: &LogAddress, ttl: Duration) -> Result<(), LogError>;

    async fn inspect(&self, address: &LogAddress) -> Result<LogState, LogError>;

    /// The newest record, if any.
    async fn last(&self, address: &LogAddress) -> Result<Option<FragmentRecord>, LogError>;

    /// Time left before the log expires; `None` if missing or persistent.
    async fn ttl(&self, address: &LogAddress) -> Result<Option<Duration>, LogError>;
}
