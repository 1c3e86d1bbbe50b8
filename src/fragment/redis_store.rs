//! Redis Streams backend for fragment logs.
//!
//! # Key Structure
//!
//! Each log is one stream key (the log address). Entries carry the `seq`,
//! `at` and `body` fields described in [`super::record`].
//!
//! - appends run one Lua script: check the newest entry, `XADD <key>
//!   MAXLEN ~ <n> *`, then `PEXPIRE`, so a key never exists without a TTL
//!   and nothing lands after a terminal
//! - `XREAD COUNT <n> STREAMS <key> <id>` reads after an id
//! - `PEXPIRE` / `PTTL` manage retention
//!
//! Reads are polled rather than issued with `BLOCK` so a waiting reader
//! never parks the shared multiplexed connection.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use redis::Script;
use tokio::time::Instant;
use tracing::debug;

use super::record::{
    Cursor, FragmentRecord, NewRecord, RecordId, FIELD_BODY, FIELD_EMITTED_AT, FIELD_SEQUENCE,
};
use super::store::{LogState, LogStore};
use crate::error::LogError;
use crate::scheduler::job::LogAddress;

/// Default approximate cap on records per log.
pub const DEFAULT_MAX_LEN: usize = 10_000;

/// Default pause between empty polls inside one bounded-wait read.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// KEYS: log. ARGV: ttl millis, max len, sequence, sequence field, body
/// field, then the entry's field/value pairs.
const APPEND_SCRIPT: &str = r#"
local newest = redis.call('XREVRANGE', KEYS[1], '+', '-', 'COUNT', 1)[1]
if newest then
    local fields = newest[2]
    local last_seq, body
    for i = 1, #fields, 2 do
        if fields[i] == ARGV[4] then last_seq = tonumber(fields[i + 1]) end
        if fields[i] == ARGV[5] then body = fields[i + 1] end
    end
    if body then
        local ok, decoded = pcall(cjson.decode, body)
        if ok and decoded['kind'] == 'terminal' then
            return {'sealed'}
        end
    end
    if last_seq and tonumber(ARGV[3]) ~= last_seq + 1 then
        return {'behind', tostring(last_seq)}
    end
end
local id = redis.call('XADD', KEYS[1], 'MAXLEN', '~', ARGV[2], '*', unpack(ARGV, 6))
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return {'ok', id}
"#;

/// Fragment log store backed by Redis Streams.
#[derive(Clone)]
pub struct RedisLogStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Approximate MAXLEN applied on every append.
    max_len: usize,
    /// Sleep between polls while waiting for new records.
    poll_interval: Duration,
    append_script: Script,
}

impl RedisLogStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `LogError::Transport` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, LogError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(redis))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            max_len: DEFAULT_MAX_LEN,
            poll_interval: DEFAULT_POLL_INTERVAL,
            append_script: Script::new(APPEND_SCRIPT),
        }
    }

    /// Sets the approximate per-log record cap.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    /// Sets the pause between polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn read_once(
        &self,
        address: &LogAddress,
        after: RecordId,
        limit: usize,
    ) -> Result<Vec<FragmentRecord>, LogError> {
        let mut conn = self.redis.clone();

        let reply: Option<StreamReadReply> = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(limit.max(1))
            .arg("STREAMS")
            .arg(address.as_str())
            .arg(after.to_string())
            .query_async(&mut conn)
            .await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| decode(address, &entry))
            .collect()
    }
}

fn append_outcome(address: &LogAddress, sequence: u64, reply: &[String]) -> Result<RecordId, LogError> {
    let malformed = |reason: &str| LogError::Malformed {
        address: address.to_string(),
        id: reply.join(" "),
        reason: reason.to_string(),
    };

    match reply.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["ok", id] => id
            .parse()
            .map_err(|_| malformed("store returned an unparseable id")),
        ["sealed"] => Err(LogError::Sealed {
            address: address.to_string(),
        }),
        ["behind", last] => {
            let last: u64 = last
                .parse()
                .map_err(|_| malformed("store returned an unparseable sequence"))?;
            Err(LogError::OutOfSequence {
                address: address.to_string(),
                expected: last + 1,
                got: sequence,
            })
        }
        _ => Err(malformed("unexpected append reply")),
    }
}

fn decode(address: &LogAddress, entry: &StreamId) -> Result<FragmentRecord, LogError> {
    FragmentRecord::from_fields(
        address.as_str(),
        &entry.id,
        entry.get::<String>(FIELD_SEQUENCE),
        entry.get::<String>(FIELD_EMITTED_AT),
        entry.get::<String>(FIELD_BODY),
    )
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn append(
        &self,
        address: &LogAddress,
        record: NewRecord,
        ttl: Duration,
    ) -> Result<RecordId, LogError> {
        let mut conn = self.redis.clone();

        let mut invocation = self.append_script.prepare_invoke();
        invocation
            .key(address.as_str())
            .arg(ttl.as_millis().max(1) as u64)
            .arg(self.max_len)
            .arg(record.sequence)
            .arg(FIELD_SEQUENCE)
            .arg(FIELD_BODY);
        for (field, value) in record.to_fields()? {
            invocation.arg(field).arg(value);
        }

        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        append_outcome(address, record.sequence, &reply)
    }

    async fn read_after(
        &self,
        address: &LogAddress,
        after: Cursor,
        max_wait: Duration,
        limit: usize,
    ) -> Result<Vec<FragmentRecord>, LogError> {
        let deadline = Instant::now() + max_wait;
        let floor = after.floor();

        loop {
            let records = self.read_once(address, floor, limit).await?;
            if !records.is_empty() {
                return Ok(records);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(log_address = %address, after = %floor, "No records within wait");
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn expire(&self, address: &LogAddress, ttl: Duration) -> Result<(), LogError> {
        let mut conn = self.redis.clone();
        let millis = ttl.as_millis().max(1) as u64;
        redis::cmd("PEXPIRE")
            .arg(address.as_str())
            .arg(millis)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn inspect(&self, address: &LogAddress) -> Result<LogState, LogError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.cmd("EXISTS")
            .arg(address.as_str())
            .cmd("XLEN")
            .arg(address.as_str());
        let (exists, len): (bool, usize) = pipe.query_async(&mut conn).await?;

        Ok(match (exists, len) {
            (false, _) => LogState::Missing,
            (true, 0) => LogState::Empty,
            (true, n) => LogState::Populated(n),
        })
    }

    async fn last(&self, address: &LogAddress) -> Result<Option<FragmentRecord>, LogError> {
        let mut conn = self.redis.clone();

        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(address.as_str())
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        reply
            .ids
            .first()
            .map(|entry| decode(address, entry))
            .transpose()
    }

    async fn ttl(&self, address: &LogAddress) -> Result<Option<Duration>, LogError> {
        let mut conn = self.redis.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(address.as_str())
            .query_async(&mut conn)
            .await?;

        // -2: no such key, -1: no expiry set
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_append_outcome_accepts_new_id() {
        let address = LogAddress::from("relay:log:c");
        let id = append_outcome(&address, 0, &reply(&["ok", "1700000000000-3"])).unwrap();
        assert_eq!(id.to_string(), "1700000000000-3");
    }

    #[test]
    fn test_append_outcome_reports_fences() {
        let address = LogAddress::from("relay:log:c");

        let sealed = append_outcome(&address, 4, &reply(&["sealed"]));
        assert!(matches!(sealed, Err(LogError::Sealed { .. })));

        let behind = append_outcome(&address, 2, &reply(&["behind", "2"]));
        assert!(matches!(
            behind,
            Err(LogError::OutOfSequence { expected: 3, got: 2, .. })
        ));

        let garbage = append_outcome(&address, 0, &reply(&["what"]));
        assert!(matches!(garbage, Err(LogError::Malformed { .. })));
    }

    #[test]
    fn test_append_script_fences_before_writing() {
        let fence = APPEND_SCRIPT.find("'sealed'").unwrap();
        let write = APPEND_SCRIPT.find("XADD").unwrap();
        let expire = APPEND_SCRIPT.find("PEXPIRE").unwrap();
        assert!(fence < write && write < expire);
    }
}
