use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostTarget(String);

impl HostTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `host:port`, with IPv6 literals in brackets.
    pub fn authority(&self, port: u16) -> String {
        if self.0.contains(':') && !self.0.starts_with('[') {
            format!("[{}]:{}", self.0, port)
        } else {
            format!("{}:{}", self.0, port)
        }
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Adapter payload before normalization. Every field is optional because
/// remote sources routinely omit some of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawRecord {
    HealthSample(HealthSample),
    LogEvent(RawLogEvent),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default)]
    pub disk_total_bytes: Option<u64>,
    #[serde(default)]
    pub disk_free_bytes: Option<u64>,
    #[serde(default)]
    pub mem_total_bytes: Option<u64>,
    #[serde(default)]
    pub mem_free_bytes: Option<u64>,
    #[serde(default)]
    pub last_boot: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLogEvent {
    #[serde(default)]
    pub log_name: Option<String>,
    /// Windows level code (1 critical .. 5 verbose).
    #[serde(default)]
    pub level: Option<u8>,
    #[serde(default)]
    pub event_id: Option<u32>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub thread_id: Option<u32>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Information,
    Verbose,
}

impl LogLevel {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => LogLevel::Critical,
            2 => LogLevel::Error,
            3 => LogLevel::Warning,
            5 => LogLevel::Verbose,
            _ => LogLevel::Information,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            LogLevel::Critical => 1,
            LogLevel::Error => 2,
            LogLevel::Warning => 3,
            LogLevel::Information => 4,
            LogLevel::Verbose => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Critical => "Critical",
            LogLevel::Error => "Error",
            LogLevel::Warning => "Warning",
            LogLevel::Information => "Information",
            LogLevel::Verbose => "Verbose",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRecord {
    Health(HealthRecord),
    LogEvent(LogEventRecord),
}

impl NormalizedRecord {
    pub fn host(&self) -> &HostTarget {
        match self {
            NormalizedRecord::Health(r) => &r.host,
            NormalizedRecord::LogEvent(r) => &r.host,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            NormalizedRecord::Health(r) => r.timestamp,
            NormalizedRecord::LogEvent(r) => r.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthRecord {
    pub host: HostTarget,
    pub timestamp: DateTime<Utc>,
    pub drive_id: String,
    pub disk_used_percent: f64,
    pub disk_free_bytes: u64,
    pub disk_total_bytes: u64,
    pub mem_used_percent: f64,
    pub mem_free_bytes: u64,
    pub mem_total_bytes: u64,
    pub uptime_days: f64,
    pub last_boot: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEventRecord {
    pub host: HostTarget,
    pub timestamp: DateTime<Utc>,
    pub log_name: String,
    pub level: LogLevel,
    pub event_id: u32,
    pub source: String,
    pub message: String,
    pub detail: Option<EventDetail>,
}

/// Present only when the run is in detailed mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDetail {
    pub process_id: Option<u32>,
    pub thread_id: Option<u32>,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    Ok,
    Warning,
    Attention,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Attention => "ATTENTION",
            Status::Error => "ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: Status,
    pub reasons: Vec<String>,
}

impl Verdict {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            reasons: Vec::new(),
        }
    }

    /// Raises the status (never lowers it) and appends the reason.
    pub fn escalate(&mut self, status: Status, reason: String) {
        self.status = self.status.max(status);
        self.reasons.push(reason);
    }
}

/// One stored row of a host result: the record, its verdict and how many
/// raw records collapsed into it under dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub record: NormalizedRecord,
    pub verdict: Verdict,
    pub occurrences: u32,
}

impl Observation {
    pub fn new(record: NormalizedRecord, verdict: Verdict) -> Self {
        Self {
            record,
            verdict,
            occurrences: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_brackets_ipv6_literals() {
        assert_eq!(HostTarget::new("srv01").authority(5985), "srv01:5985");
        assert_eq!(HostTarget::new("10.0.0.4").authority(80), "10.0.0.4:80");
        assert_eq!(HostTarget::new("::1").authority(9182), "[::1]:9182");
        assert_eq!(HostTarget::new("[fe80::1]").authority(1), "[fe80::1]:1");
    }

    #[test]
    fn level_code_mapping_is_total() {
        for code in 0..=u8::MAX {
            let level = LogLevel::from_code(code);
            if (1..=5).contains(&code) && code != 4 {
                assert_eq!(level.code(), code);
            } else {
                assert_eq!(level, LogLevel::Information);
            }
        }
    }

    #[test]
    fn status_order_reserves_error_as_highest() {
        assert!(Status::Ok < Status::Warning);
        assert!(Status::Warning < Status::Attention);
        assert!(Status::Attention < Status::Error);
    }

    #[test]
    fn escalate_never_lowers_status() {
        let mut verdict = Verdict::ok();
        verdict.escalate(Status::Attention, "a".to_string());
        verdict.escalate(Status::Warning, "b".to_string());
        assert_eq!(verdict.status, Status::Attention);
        assert_eq!(verdict.reasons, vec!["a", "b"]);
    }

    #[test]
    fn raw_records_parse_from_tagged_yaml() {
        let yaml = r#"
- type: log_event
  level: 2
  event_id: 7
  source: Disk
- type: health_sample
  drive_id: "C:"
  disk_total_bytes: 100
"#;
        let parsed: Vec<RawRecord> = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(parsed.len(), 2);
        assert!(matches!(&parsed[0], RawRecord::LogEvent(e) if e.event_id == Some(7)));
        assert!(matches!(&parsed[1], RawRecord::HealthSample(h) if h.disk_total_bytes == Some(100)));
    }
}
