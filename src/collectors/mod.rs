pub mod agent;
pub mod fixture;
pub mod probe;
pub mod system;

use crate::records::{HostTarget, LogLevel, RawLogEvent, RawRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Asks one host for records of one kind. Implementations are read-only
/// and must honour `QuerySpec::max_records`.
#[async_trait]
pub trait HostQuery: Send + Sync {
    async fn query(
        &self,
        host: &HostTarget,
        spec: &QuerySpec,
    ) -> Result<Vec<RawRecord>, QueryError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuerySpec {
    Health(HealthQuery),
    Log(LogQuery),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthQuery {
    pub max_records: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogQuery {
    pub log_name: String,
    pub since: DateTime<Utc>,
    pub levels: BTreeSet<LogLevel>,
    pub event_ids: Option<BTreeSet<u32>>,
    pub max_records: usize,
}

impl QuerySpec {
    pub fn label(&self) -> &str {
        match self {
            QuerySpec::Health(_) => "health",
            QuerySpec::Log(q) => &q.log_name,
        }
    }

    pub fn max_records(&self) -> usize {
        match self {
            QuerySpec::Health(q) => q.max_records,
            QuerySpec::Log(q) => q.max_records,
        }
    }
}

impl LogQuery {
    /// Events without a creation time are kept; the adapter could not tell
    /// their age and dropping them would hide data.
    pub fn matches(&self, event: &RawLogEvent) -> bool {
        if let Some(created) = event.time_created {
            if created < self.since {
                return false;
            }
        }
        let level = LogLevel::from_code(event.level.unwrap_or(LogLevel::Information.code()));
        if !self.levels.contains(&level) {
            return false;
        }
        match (&self.event_ids, event.event_id) {
            (Some(allowed), Some(id)) => allowed.contains(&id),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Applies the filter, fills in the log name and enforces the cap.
    pub fn select(&self, events: impl IntoIterator<Item = RawLogEvent>) -> Vec<RawRecord> {
        events
            .into_iter()
            .filter(|e| self.matches(e))
            .take(self.max_records)
            .map(|mut e| {
                if e.log_name.as_deref().map_or(true, |n| n.trim().is_empty()) {
                    e.log_name = Some(self.log_name.clone());
                }
                RawRecord::LogEvent(e)
            })
            .collect()
    }
}

pub fn cap(mut records: Vec<RawRecord>, max_records: usize) -> Vec<RawRecord> {
    records.truncate(max_records);
    records
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    Unreachable,
    AccessDenied,
    Timeout,
    Unsupported,
    Cancelled,
}

impl QueryErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryErrorKind::Unreachable => "Unreachable",
            QueryErrorKind::AccessDenied => "AccessDenied",
            QueryErrorKind::Timeout => "Timeout",
            QueryErrorKind::Unsupported => "Unsupported",
            QueryErrorKind::Cancelled => "Cancelled",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, QueryErrorKind::Unreachable | QueryErrorKind::Timeout)
    }
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Unreachable, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Unsupported, message)
    }
}
