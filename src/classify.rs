use crate::records::{HealthRecord, LogEventRecord, LogLevel, NormalizedRecord, Status, Verdict};
use serde::{Deserialize, Serialize};

/// Turns a normalized record into a verdict. Implementations must be pure.
pub trait Classifier: Send + Sync {
    fn classify(&self, record: &NormalizedRecord) -> Verdict;
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Thresholds {
    #[serde(default = "default_disk_percent")]
    pub disk_percent: f64,
    #[serde(default = "default_memory_percent")]
    pub memory_percent: f64,
    #[serde(default = "default_stale_boot_days")]
    pub stale_boot_days: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            disk_percent: default_disk_percent(),
            memory_percent: default_memory_percent(),
            stale_boot_days: default_stale_boot_days(),
        }
    }
}

impl Classifier for Thresholds {
    fn classify(&self, record: &NormalizedRecord) -> Verdict {
        classify(record, self)
    }
}

pub fn classify(record: &NormalizedRecord, thresholds: &Thresholds) -> Verdict {
    match record {
        NormalizedRecord::Health(r) => classify_health(r, thresholds),
        NormalizedRecord::LogEvent(r) => classify_event(r),
    }
}

// Breaches accumulate in a fixed order: disk, memory, uptime.
fn classify_health(record: &HealthRecord, thresholds: &Thresholds) -> Verdict {
    let mut verdict = Verdict::ok();
    if record.disk_used_percent > thresholds.disk_percent {
        verdict.escalate(
            Status::Warning,
            format!("Disk {} at {}%", record.drive_id, record.disk_used_percent),
        );
    }
    if record.mem_used_percent > thresholds.memory_percent {
        verdict.escalate(
            Status::Warning,
            format!("Memory at {}%", record.mem_used_percent),
        );
    }
    if record.uptime_days > thresholds.stale_boot_days {
        verdict.escalate(
            Status::Attention,
            format!("Uptime {} days since last boot", record.uptime_days),
        );
    }
    verdict
}

fn classify_event(record: &LogEventRecord) -> Verdict {
    let status = match record.level {
        LogLevel::Critical | LogLevel::Error => Status::Attention,
        LogLevel::Warning => Status::Warning,
        LogLevel::Information | LogLevel::Verbose => return Verdict::ok(),
    };
    let mut verdict = Verdict::ok();
    verdict.escalate(
        status,
        format!(
            "{} event {} from {}",
            record.level, record.event_id, record.source
        ),
    );
    verdict
}

const fn default_disk_percent() -> f64 {
    80.0
}

const fn default_memory_percent() -> f64 {
    90.0
}

const fn default_stale_boot_days() -> f64 {
    30.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::HostTarget;
    use chrono::{TimeZone, Utc};

    fn health(disk: f64, mem: f64, uptime: f64) -> NormalizedRecord {
        NormalizedRecord::Health(HealthRecord {
            host: HostTarget::new("A"),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            drive_id: "C:".to_string(),
            disk_used_percent: disk,
            disk_free_bytes: 0,
            disk_total_bytes: 0,
            mem_used_percent: mem,
            mem_free_bytes: 0,
            mem_total_bytes: 0,
            uptime_days: uptime,
            last_boot: None,
        })
    }

    fn event(level: LogLevel) -> NormalizedRecord {
        NormalizedRecord::LogEvent(LogEventRecord {
            host: HostTarget::new("A"),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            log_name: "System".to_string(),
            level,
            event_id: 41,
            source: "Kernel-Power".to_string(),
            message: "m".to_string(),
            detail: None,
        })
    }

    #[test]
    fn disk_breach_at_92_percent() {
        let verdict = classify(&health(92.0, 10.0, 1.0), &Thresholds::default());
        assert_eq!(verdict.status, Status::Warning);
        assert_eq!(verdict.reasons, vec!["Disk C: at 92%"]);
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let t = Thresholds::default();
        assert_eq!(classify(&health(80.0, 10.0, 1.0), &t).status, Status::Ok);
        assert_eq!(classify(&health(81.0, 10.0, 1.0), &t).status, Status::Warning);
        assert_eq!(classify(&health(10.0, 90.0, 1.0), &t).status, Status::Ok);
        assert_eq!(classify(&health(10.0, 10.0, 30.0), &t).status, Status::Ok);
    }

    #[test]
    fn breaches_accumulate_in_order_and_stale_boot_escalates() {
        let verdict = classify(&health(95.0, 97.5, 45.25), &Thresholds::default());
        assert_eq!(verdict.status, Status::Attention);
        assert_eq!(
            verdict.reasons,
            vec![
                "Disk C: at 95%",
                "Memory at 97.5%",
                "Uptime 45.25 days since last boot"
            ]
        );
    }

    #[test]
    fn event_levels_map_without_threshold_math() {
        let t = Thresholds::default();
        assert_eq!(classify(&event(LogLevel::Critical), &t).status, Status::Attention);
        assert_eq!(classify(&event(LogLevel::Error), &t).status, Status::Attention);
        assert_eq!(classify(&event(LogLevel::Warning), &t).status, Status::Warning);
        let info = classify(&event(LogLevel::Information), &t);
        assert_eq!(info, Verdict::ok());
        assert_eq!(
            classify(&event(LogLevel::Critical), &t).reasons,
            vec!["Critical event 41 from Kernel-Power"]
        );
    }

    #[test]
    fn classification_is_repeatable() {
        let t = Thresholds::default();
        let record = health(99.0, 99.0, 99.0);
        assert_eq!(classify(&record, &t), classify(&record, &t));
        assert_eq!(t.classify(&record), classify(&record, &t));
    }

    #[test]
    fn classifier_never_reports_error() {
        let t = Thresholds {
            disk_percent: 0.0,
            memory_percent: 0.0,
            stale_boot_days: 0.0,
        };
        assert!(classify(&health(100.0, 100.0, 1000.0), &t).status < Status::Error);
    }
}
