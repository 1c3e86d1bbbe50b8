//! In-process fragment log store.
//!
//! Mirrors the Redis backend closely enough to run the whole relay inside
//! one process: stream-style ids, approximate length capping, per-key
//! expiry (applied lazily on access) and bounded-wait reads woken by
//! appends instead of polling.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::record::{Cursor, FragmentRecord, NewRecord, RecordId};
use super::store::{LogState, LogStore};
use crate::error::LogError;
use crate::scheduler::job::LogAddress;

#[derive(Debug, Default)]
struct MemoryLog {
    records: VecDeque<FragmentRecord>,
    last_id: RecordId,
    expires_at: Option<Instant>,
}

impl MemoryLog {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Fragment log store held in process memory.
#[derive(Debug)]
pub struct MemoryLogStore {
    logs: Mutex<HashMap<LogAddress, MemoryLog>>,
    appended: Notify,
    max_len: usize,
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            max_len: super::redis_store::DEFAULT_MAX_LEN,
        }
    }

    /// Sets the per-log record cap; the oldest records are dropped beyond it.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    /// Number of live logs.
    pub async fn log_count(&self) -> usize {
        let now = Instant::now();
        let logs = self.logs.lock().await;
        logs.values().filter(|log| !log.is_expired(now)).count()
    }

    /// Creates a log that exists but holds no records.
    #[cfg(test)]
    pub(crate) async fn insert_empty(&self, address: &LogAddress) {
        self.logs
            .lock()
            .await
            .insert(address.clone(), MemoryLog::default());
    }

    fn live<'a>(
        logs: &'a mut HashMap<LogAddress, MemoryLog>,
        address: &LogAddress,
        now: Instant,
    ) -> Option<&'a mut MemoryLog> {
        if logs.get(address).is_some_and(|log| log.is_expired(now)) {
            logs.remove(address);
        }
        logs.get_mut(address)
    }

    async fn collect_after(
        &self,
        address: &LogAddress,
        after: Cursor,
        limit: usize,
    ) -> Vec<FragmentRecord> {
        let mut logs = self.logs.lock().await;
        match Self::live(&mut logs, address, Instant::now()) {
            Some(log) => log
                .records
                .iter()
                .filter(|record| after.admits(record.id))
                .take(limit.max(1))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

fn check_fence(
    address: &LogAddress,
    newest: Option<&FragmentRecord>,
    record: &NewRecord,
) -> Result<(), LogError> {
    let Some(newest) = newest else {
        return Ok(());
    };
    if newest.is_terminal() {
        return Err(LogError::Sealed {
            address: address.to_string(),
        });
    }
    if record.sequence != newest.sequence + 1 {
        return Err(LogError::OutOfSequence {
            address: address.to_string(),
            expected: newest.sequence + 1,
            got: record.sequence,
        });
    }
    Ok(())
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(
        &self,
        address: &LogAddress,
        record: NewRecord,
        ttl: Duration,
    ) -> Result<RecordId, LogError> {
        let now = Instant::now();
        let mut logs = self.logs.lock().await;

        match Self::live(&mut logs, address, now) {
            Some(log) => check_fence(address, log.records.back(), &record)?,
            // New key: drop whatever else has expired meanwhile.
            None => logs.retain(|_, log| !log.is_expired(now)),
        }

        let log = logs.entry(address.clone()).or_default();
        let wall_millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let id = log.last_id.successor(wall_millis);
        log.last_id = id;
        log.records.push_back(record.into_record(id));
        while log.records.len() > self.max_len {
            log.records.pop_front();
        }
        log.expires_at = Some(now + ttl);
        drop(logs);

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_after(
        &self,
        address: &LogAddress,
        after: Cursor,
        max_wait: Duration,
        limit: usize,
    ) -> Result<Vec<FragmentRecord>, LogError> {
        let deadline = Instant::now() + max_wait;

        loop {
            // Register for the wakeup before looking, so an append landing
            // between the check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.collect_after(address, after, limit).await;
            if !records.is_empty() {
                return Ok(records);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn expire(&self, address: &LogAddress, ttl: Duration) -> Result<(), LogError> {
        let now = Instant::now();
        let mut logs = self.logs.lock().await;
        if let Some(log) = Self::live(&mut logs, address, now) {
            log.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn inspect(&self, address: &LogAddress) -> Result<LogState, LogError> {
        let mut logs = self.logs.lock().await;
        Ok(match Self::live(&mut logs, address, Instant::now()) {
            None => LogState::Missing,
            Some(log) if log.records.is_empty() => LogState::Empty,
            Some(log) => LogState::Populated(log.records.len()),
        })
    }

    async fn last(&self, address: &LogAddress) -> Result<Option<FragmentRecord>, LogError> {
        let mut logs = self.logs.lock().await;
        Ok(Self::live(&mut logs, address, Instant::now()).and_then(|log| log.records.back().cloned()))
    }

    async fn ttl(&self, address: &LogAddress) -> Result<Option<Duration>, LogError> {
        let now = Instant::now();
        let mut logs = self.logs.lock().await;
        Ok(Self::live(&mut logs, address, now)
            .and_then(|log| log.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::record::Outcome;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    fn address(name: &str) -> LogAddress {
        LogAddress::from(format!("test:log:{}", name))
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let store = MemoryLogStore::new();
        let addr = address("ids");

        let mut last = RecordId::ZERO;
        for seq in 0..50 {
            let id = store.append(&addr, NewRecord::fragment(seq, "x"), TTL).await.unwrap();
            assert!(id > last);
            last = id;
        }
        assert_eq!(store.inspect(&addr).await.unwrap(), LogState::Populated(50));
    }

    #[tokio::test]
    async fn test_inspect_states() {
        let store = MemoryLogStore::new();
        let addr = address("inspect");

        assert_eq!(store.inspect(&addr).await.unwrap(), LogState::Missing);
        store.insert_empty(&addr).await;
        assert_eq!(store.inspect(&addr).await.unwrap(), LogState::Empty);
        store.append(&addr, NewRecord::fragment(0, "a"), TTL).await.unwrap();
        assert_eq!(store.inspect(&addr).await.unwrap(), LogState::Populated(1));
    }

    #[tokio::test]
    async fn test_read_after_respects_cursor_and_limit() {
        let store = MemoryLogStore::new();
        let addr = address("cursor");

        let mut ids = Vec::new();
        for (seq, payload) in ["a", "b", "c", "d"].iter().enumerate() {
            ids.push(
                store
                    .append(&addr, NewRecord::fragment(seq as u64, *payload), TTL)
                    .await
                    .unwrap(),
            );
        }

        let all = store
            .read_after(&addr, Cursor::Start, Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 4);

        let tail = store
            .read_after(&addr, Cursor::After(ids[1]), Duration::ZERO, 1)
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload(), Some("c"));
    }

    #[tokio::test]
    async fn test_read_after_wakes_on_append() {
        let store = Arc::new(MemoryLogStore::new());
        let addr = address("wake");

        let reader = {
            let store = Arc::clone(&store);
            let addr = addr.clone();
            tokio::spawn(async move {
                store
                    .read_after(&addr, Cursor::Start, Duration::from_secs(5), 10)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append(&addr, NewRecord::fragment(0, "late"), TTL).await.unwrap();

        let records = reader.await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload(), Some("late"));
    }

    #[tokio::test]
    async fn test_read_after_times_out_empty() {
        let store = MemoryLogStore::new();
        let records = store
            .read_after(&address("quiet"), Cursor::Start, Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_removes_log() {
        let store = MemoryLogStore::new();
        let addr = address("ttl");

        store
            .append(&addr, NewRecord::fragment(0, "a"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.ttl(&addr).await.unwrap(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(4)).await;
        store.expire(&addr, Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(matches!(store.inspect(&addr).await.unwrap(), LogState::Populated(1)));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.inspect(&addr).await.unwrap(), LogState::Missing);
        assert_eq!(store.ttl(&addr).await.unwrap(), None);
        assert_eq!(store.log_count().await, 0);
    }

    #[tokio::test]
    async fn test_max_len_drops_oldest() {
        let store = MemoryLogStore::new().with_max_len(3);
        let addr = address("cap");

        for seq in 0..5 {
            store.append(&addr, NewRecord::fragment(seq, "x"), TTL).await.unwrap();
        }

        let records = store
            .read_after(&addr, Cursor::Start, Duration::ZERO, 10)
            .await
            .unwrap();
        let seqs: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_last_returns_newest() {
        let store = MemoryLogStore::new();
        let addr = address("last");

        assert!(store.last(&addr).await.unwrap().is_none());
        store.append(&addr, NewRecord::fragment(0, "a"), TTL).await.unwrap();
        store
            .append(&addr, NewRecord::terminal(1, Outcome::Success, None), TTL)
            .await
            .unwrap();

        let last = store.last(&addr).await.unwrap().unwrap();
        assert!(last.is_terminal());
    }

    #[tokio::test]
    async fn test_append_after_terminal_is_rejected() {
        let store = MemoryLogStore::new();
        let addr = address("sealed");

        store.append(&addr, NewRecord::fragment(0, "a"), TTL).await.unwrap();
        store
            .append(&addr, NewRecord::terminal(1, Outcome::Error, Some("gone".to_string())), TTL)
            .await
            .unwrap();

        let late = store.append(&addr, NewRecord::fragment(2, "b"), TTL).await;
        assert!(matches!(late, Err(LogError::Sealed { .. })));
        let second_terminal = store
            .append(&addr, NewRecord::terminal(2, Outcome::Success, None), TTL)
            .await;
        assert!(matches!(second_terminal, Err(LogError::Sealed { .. })));
        assert_eq!(store.inspect(&addr).await.unwrap(), LogState::Populated(2));
    }

    #[tokio::test]
    async fn test_append_requires_next_sequence() {
        let store = MemoryLogStore::new();
        let addr = address("sequence");

        store.append(&addr, NewRecord::fragment(0, "a"), TTL).await.unwrap();
        store.append(&addr, NewRecord::fragment(1, "b"), TTL).await.unwrap();

        let stale = store.append(&addr, NewRecord::fragment(1, "again"), TTL).await;
        assert!(matches!(
            stale,
            Err(LogError::OutOfSequence { expected: 2, got: 1, .. })
        ));
        let records = store
            .read_after(&addr, Cursor::Start, Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }
}
