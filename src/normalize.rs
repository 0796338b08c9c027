use crate::records::{
    EventDetail, HealthRecord, HealthSample, HostTarget, LogEventRecord, LogLevel,
    NormalizedRecord, RawLogEvent, RawRecord,
};
use chrono::{DateTime, Utc};

pub const NO_MESSAGE: &str = "No message available";
pub const NOT_AVAILABLE: &str = "N/A";
pub const UNKNOWN_SOURCE: &str = "Unknown";

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    pub message_cap: usize,
    pub detailed: bool,
}

impl Normalizer {
    pub fn new(message_cap: usize, detailed: bool) -> Self {
        Self {
            message_cap,
            detailed,
        }
    }

    /// Never fails: missing or malformed fields fall back to defaults so a
    /// single bad field does not drop the record.
    pub fn normalize(
        &self,
        host: &HostTarget,
        raw: RawRecord,
        observed_at: DateTime<Utc>,
    ) -> NormalizedRecord {
        match raw {
            RawRecord::HealthSample(sample) => {
                NormalizedRecord::Health(normalize_health(host, sample, observed_at))
            }
            RawRecord::LogEvent(event) => {
                NormalizedRecord::LogEvent(self.normalize_event(host, event, observed_at))
            }
        }
    }

    fn normalize_event(
        &self,
        host: &HostTarget,
        event: RawLogEvent,
        observed_at: DateTime<Utc>,
    ) -> LogEventRecord {
        let detail = self.detailed.then(|| EventDetail {
            process_id: event.process_id,
            thread_id: event.thread_id,
            user_id: non_blank(event.user_id).unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        });
        LogEventRecord {
            host: host.clone(),
            timestamp: event.time_created.unwrap_or(observed_at),
            log_name: non_blank(event.log_name).unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            level: LogLevel::from_code(event.level.unwrap_or(LogLevel::Information.code())),
            event_id: event.event_id.unwrap_or(0),
            source: non_blank(event.source).unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
            message: clean_message(event.message.as_deref(), self.message_cap),
            detail,
        }
    }
}

fn normalize_health(
    host: &HostTarget,
    sample: HealthSample,
    observed_at: DateTime<Utc>,
) -> HealthRecord {
    let disk_total_bytes = sample.disk_total_bytes.unwrap_or(0);
    let disk_free_bytes = sample.disk_free_bytes.unwrap_or(0).min(disk_total_bytes);
    let mem_total_bytes = sample.mem_total_bytes.unwrap_or(0);
    let mem_free_bytes = sample.mem_free_bytes.unwrap_or(0).min(mem_total_bytes);

    let uptime_days = sample
        .last_boot
        .map(|boot| {
            let secs = observed_at.signed_duration_since(boot).num_seconds().max(0);
            round2(secs as f64 / 86_400.0)
        })
        .unwrap_or(0.0);

    HealthRecord {
        host: host.clone(),
        timestamp: observed_at,
        drive_id: non_blank(sample.drive_id).unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        disk_used_percent: used_percent(disk_free_bytes, disk_total_bytes),
        disk_free_bytes,
        disk_total_bytes,
        mem_used_percent: used_percent(mem_free_bytes, mem_total_bytes),
        mem_free_bytes,
        mem_total_bytes,
        uptime_days,
        last_boot: sample.last_boot,
    }
}

fn used_percent(free: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(free);
    round2((used as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Collapses every run of line terminators into one space, then cuts the
/// result to `cap` characters.
pub fn clean_message(message: Option<&str>, cap: usize) -> String {
    let Some(message) = message else {
        return NO_MESSAGE.to_string();
    };
    let mut flat = String::with_capacity(message.len().min(cap.saturating_mul(4)));
    let mut in_break = false;
    for ch in message.chars() {
        if matches!(ch, '\r' | '\n' | '\u{2028}' | '\u{2029}') {
            if !in_break {
                flat.push(' ');
                in_break = true;
            }
        } else {
            flat.push(ch);
            in_break = false;
        }
    }
    let flat = flat.trim();
    if flat.is_empty() {
        return NO_MESSAGE.to_string();
    }
    flat.chars().take(cap).collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn health_percentages_round_to_two_decimals() {
        let sample = HealthSample {
            drive_id: Some("C:".to_string()),
            disk_total_bytes: Some(3),
            disk_free_bytes: Some(1),
            mem_total_bytes: Some(1000),
            mem_free_bytes: Some(80),
            last_boot: Some(now() - Duration::hours(36)),
        };
        let record = normalize_health(&HostTarget::new("A"), sample, now());
        assert_eq!(record.disk_used_percent, 66.67);
        assert_eq!(record.mem_used_percent, 92.0);
        assert_eq!(record.uptime_days, 1.5);
        assert_eq!(
            record.disk_free_bytes + (record.disk_total_bytes - record.disk_free_bytes),
            record.disk_total_bytes
        );
    }

    #[test]
    fn empty_health_sample_uses_defaults() {
        let record = normalize_health(&HostTarget::new("A"), HealthSample::default(), now());
        assert_eq!(record.drive_id, NOT_AVAILABLE);
        assert_eq!(record.disk_used_percent, 0.0);
        assert_eq!(record.uptime_days, 0.0);
        assert!(record.last_boot.is_none());
    }

    #[test]
    fn free_above_total_is_clamped() {
        let sample = HealthSample {
            disk_total_bytes: Some(100),
            disk_free_bytes: Some(150),
            ..HealthSample::default()
        };
        let record = normalize_health(&HostTarget::new("A"), sample, now());
        assert_eq!(record.disk_free_bytes, 100);
        assert_eq!(record.disk_used_percent, 0.0);
    }

    #[test]
    fn message_is_flattened_and_capped() {
        assert_eq!(
            clean_message(Some("line one\r\nline two\n\nthree"), 500),
            "line one line two three"
        );
        assert_eq!(clean_message(Some("abcdef"), 3), "abc");
        assert_eq!(clean_message(None, 10), NO_MESSAGE);
        assert_eq!(clean_message(Some(" \n "), 10), NO_MESSAGE);
    }

    #[test]
    fn unbounded_cap_keeps_whole_message() {
        assert_eq!(clean_message(Some("abc"), usize::MAX), "abc");
    }

    #[test]
    fn missing_event_fields_get_defaults() {
        let normalizer = Normalizer::new(500, true);
        let record = normalizer.normalize(
            &HostTarget::new("A"),
            RawRecord::LogEvent(RawLogEvent::default()),
            now(),
        );
        match record {
            NormalizedRecord::LogEvent(e) => {
                assert_eq!(e.message, NO_MESSAGE);
                assert_eq!(e.source, UNKNOWN_SOURCE);
                assert_eq!(e.level, LogLevel::Information);
                assert_eq!(e.timestamp, now());
                let detail = e.detail.expect("detailed mode keeps detail");
                assert_eq!(detail.user_id, NOT_AVAILABLE);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn detail_is_absent_outside_detailed_mode() {
        let normalizer = Normalizer::new(500, false);
        let raw = RawLogEvent {
            process_id: Some(4),
            user_id: Some("S-1-5-18".to_string()),
            ..RawLogEvent::default()
        };
        match normalizer.normalize(&HostTarget::new("A"), RawRecord::LogEvent(raw), now()) {
            NormalizedRecord::LogEvent(e) => assert!(e.detail.is_none()),
            other => panic!("unexpected record {other:?}"),
        }
    }
}
