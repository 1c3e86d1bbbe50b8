//! Fragment log records and cursors.
//!
//! A log entry carries three fields: the producer-assigned `seq`, the
//! RFC 3339 `at` timestamp, and a JSON `body` that is either a fragment
//! payload or the terminal sentinel.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::LogError;

pub const FIELD_SEQUENCE: &str = "seq";
pub const FIELD_EMITTED_AT: &str = "at";
pub const FIELD_BODY: &str = "body";

/// A record id string that does not parse as `<millis>-<seq>`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid record id '{0}'")]
pub struct InvalidRecordId(pub String);

/// Store-assigned record id, ordered like a Redis stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RecordId {
    pub millis: u64,
    pub seq: u64,
}

impl RecordId {
    pub const ZERO: RecordId = RecordId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest id strictly greater than `self` at wall time `now_millis`.
    pub fn successor(&self, now_millis: u64) -> RecordId {
        if now_millis > self.millis {
            RecordId::new(now_millis, 0)
        } else {
            RecordId::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for RecordId {
    type Err = InvalidRecordId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidRecordId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(RecordId {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// Where a reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cursor {
    /// Replay from the oldest record still in the log.
    #[default]
    Start,
    /// Resume strictly after the given record.
    After(RecordId),
}

impl Cursor {
    /// Exclusive lower bound for a read.
    pub fn floor(&self) -> RecordId {
        match self {
            Cursor::Start => RecordId::ZERO,
            Cursor::After(id) => *id,
        }
    }

    /// Returns true if `id` lies after this cursor.
    pub fn admits(&self, id: RecordId) -> bool {
        match self {
            Cursor::Start => true,
            Cursor::After(after) => id > *after,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Start => f.write_str("start"),
            Cursor::After(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Cursor {
    type Err = InvalidRecordId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "start" | "0" | "0-0" | "-" => Ok(Cursor::Start),
            other => other.parse().map(Cursor::After),
        }
    }
}

/// How a job's output stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of a log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RecordBody {
    /// One generated chunk, forwarded verbatim.
    Fragment { payload: String },
    /// The terminal sentinel. At most one per log, always last.
    Terminal {
        outcome: Outcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// A record about to be appended; the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    pub body: RecordBody,
}

impl NewRecord {
    pub fn fragment(sequence: u64, payload: impl Into<String>) -> Self {
        Self {
            sequence,
            emitted_at: Utc::now(),
            body: RecordBody::Fragment {
                payload: payload.into(),
            },
        }
    }

    pub fn terminal(sequence: u64, outcome: Outcome, reason: Option<String>) -> Self {
        Self {
            sequence,
            emitted_at: Utc::now(),
            body: RecordBody::Terminal { outcome, reason },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.body, RecordBody::Terminal { .. })
    }

    /// Field/value pairs as written to the store.
    pub fn to_fields(&self) -> Result<[(&'static str, String); 3], LogError> {
        Ok([
            (FIELD_SEQUENCE, self.sequence.to_string()),
            (FIELD_EMITTED_AT, self.emitted_at.to_rfc3339()),
            (FIELD_BODY, serde_json::to_string(&self.body)?),
        ])
    }

    /// Attaches the store-assigned id.
    pub fn into_record(self, id: RecordId) -> FragmentRecord {
        FragmentRecord {
            id,
            sequence: self.sequence,
            emitted_at: self.emitted_at,
            body: self.body,
        }
    }
}

/// A record as read back from a log.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentRecord {
    pub id: RecordId,
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    pub body: RecordBody,
}

impl FragmentRecord {
    pub fn is_terminal(&self) -> bool {
        matches!(self.body, RecordBody::Terminal { .. })
    }

    /// Fragment payload, or `None` for the terminal sentinel.
    pub fn payload(&self) -> Option<&str> {
        match &self.body {
            RecordBody::Fragment { payload } => Some(payload),
            RecordBody::Terminal { .. } => None,
        }
    }

    /// Terminal outcome and reason, or `None` for a fragment.
    pub fn outcome(&self) -> Option<(Outcome, Option<&str>)> {
        match &self.body {
            RecordBody::Terminal { outcome, reason } => Some((*outcome, reason.as_deref())),
            RecordBody::Fragment { .. } => None,
        }
    }

    /// Rebuilds a record from the raw stored fields.
    pub fn from_fields(
        address: &str,
        id: &str,
        sequence: Option<String>,
        emitted_at: Option<String>,
        body: Option<String>,
    ) -> Result<FragmentRecord, LogError> {
        let malformed = |reason: String| LogError::Malformed {
            address: address.to_string(),
            id: id.to_string(),
            reason,
        };

        let record_id: RecordId = id.parse().map_err(|e: InvalidRecordId| malformed(e.to_string()))?;
        let sequence = sequence
            .ok_or_else(|| malformed(format!("missing '{}'", FIELD_SEQUENCE)))?
            .parse::<u64>()
            .map_err(|e| malformed(format!("bad sequence: {}", e)))?;
        let emitted_at = emitted_at
            .ok_or_else(|| malformed(format!("missing '{}'", FIELD_EMITTED_AT)))
            .and_then(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| malformed(format!("bad timestamp: {}", e)))
            })?;
        let body = body.ok_or_else(|| malformed(format!("missing '{}'", FIELD_BODY)))?;
        let body: RecordBody =
            serde_json::from_str(&body).map_err(|e| malformed(format!("bad body: {}", e)))?;

        Ok(FragmentRecord {
            id: record_id,
            sequence,
            emitted_at,
            body,
        })
    }
}
