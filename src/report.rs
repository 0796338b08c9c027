use crate::aggregate::FleetRunResult;
use crate::export::format_timestamp;
use crate::records::{NormalizedRecord, Status};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Derived view over a run. Counts are weighted by `occurrences`, so a
/// deduplicated run reports the same event totals as a plain one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateStats {
    pub hosts: usize,
    pub hosts_with_failures: usize,
    pub hosts_without_data: usize,
    pub records: usize,
    pub events: u64,
    pub failures: usize,
    pub by_status: Vec<(String, u64)>,
    pub by_level: Vec<(String, u64)>,
    pub by_source: Vec<(String, u64)>,
    pub by_event_id: Vec<(u32, u64)>,
    pub by_failure_kind: Vec<(String, u64)>,
}

/// Descending count, ties broken by ascending key.
fn ranked<K: Ord>(counts: BTreeMap<K, u64>) -> Vec<(K, u64)> {
    let mut out: Vec<(K, u64)> = counts.into_iter().collect();
    out.sort_by(|a, b| b.1.cmp(&a.1));
    out
}

pub fn top<K>(rows: &[(K, u64)], n: usize) -> &[(K, u64)] {
    &rows[..rows.len().min(n)]
}

pub fn summarize(result: &FleetRunResult) -> AggregateStats {
    let mut by_status: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_level: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_source: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_event_id: BTreeMap<u32, u64> = BTreeMap::new();
    let mut by_failure_kind: BTreeMap<String, u64> = BTreeMap::new();
    let mut stats = AggregateStats {
        hosts: result.hosts.len(),
        ..AggregateStats::default()
    };

    for host in &result.hosts {
        if !host.query_errors.is_empty() {
            stats.hosts_with_failures += 1;
        }
        if host.counters.logs_processed == 0 {
            stats.hosts_without_data += 1;
        }
        for observation in &host.observations {
            let weight = u64::from(observation.occurrences);
            stats.records += 1;
            stats.events += weight;
            *by_status
                .entry(observation.verdict.status.as_str().to_string())
                .or_default() += weight;
            if let NormalizedRecord::LogEvent(e) = &observation.record {
                *by_level.entry(e.level.as_str().to_string()).or_default() += weight;
                *by_source.entry(e.source.clone()).or_default() += weight;
                *by_event_id.entry(e.event_id).or_default() += weight;
            }
        }
        for failure in &host.query_errors {
            stats.failures += 1;
            *by_status
                .entry(Status::Error.as_str().to_string())
                .or_default() += 1;
            *by_failure_kind
                .entry(failure.kind.as_str().to_string())
                .or_default() += 1;
        }
    }

    stats.by_status = ranked(by_status);
    stats.by_level = ranked(by_level);
    stats.by_source = ranked(by_source);
    stats.by_event_id = ranked(by_event_id);
    stats.by_failure_kind = ranked(by_failure_kind);
    stats
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

/// Console summary: per-host counters, groupings, and one line for every
/// failed query.
pub fn render_console(result: &FleetRunResult, stats: &AggregateStats, top_n: usize) -> String {
    let mut out = String::new();

    let mut hosts = new_table(&[
        "Host", "Records", "Critical", "Error", "Warning", "OK", "Queries OK", "Queries failed",
    ]);
    for host in &result.hosts {
        let c = &host.counters;
        hosts.add_row(vec![
            host.host.to_string(),
            c.total.to_string(),
            c.critical_count.to_string(),
            c.error_count.to_string(),
            c.warning_count.to_string(),
            c.ok_count.to_string(),
            c.logs_processed.to_string(),
            c.logs_skipped.to_string(),
        ]);
    }
    let _ = writeln!(out, "{hosts}");

    let mut status = new_table(&["Status", "Count"]);
    for (key, count) in &stats.by_status {
        status.add_row(vec![key.clone(), count.to_string()]);
    }
    let _ = writeln!(out, "{status}");

    if !stats.by_level.is_empty() {
        let mut levels = new_table(&["Level", "Events"]);
        for (key, count) in &stats.by_level {
            levels.add_row(vec![key.clone(), count.to_string()]);
        }
        let _ = writeln!(out, "{levels}");
    }

    if !stats.by_failure_kind.is_empty() {
        let mut kinds = new_table(&["Failure kind", "Queries"]);
        for (key, count) in &stats.by_failure_kind {
            kinds.add_row(vec![key.clone(), count.to_string()]);
        }
        let _ = writeln!(out, "{kinds}");
    }

    if !stats.by_source.is_empty() {
        let mut sources = new_table(&["Source", "Events"]);
        for (key, count) in top(&stats.by_source, top_n) {
            sources.add_row(vec![key.clone(), count.to_string()]);
        }
        let _ = writeln!(out, "Top {top_n} sources\n{sources}");

        let mut ids = new_table(&["Event ID", "Events"]);
        for (key, count) in top(&stats.by_event_id, top_n) {
            ids.add_row(vec![key.to_string(), count.to_string()]);
        }
        let _ = writeln!(out, "Top {top_n} event IDs\n{ids}");
    }

    for (host, failure) in result.failures() {
        let _ = writeln!(
            out,
            "FAILED host={} query={} kind={}: {}",
            host, failure.query, failure.kind, failure.message
        );
    }

    let _ = writeln!(
        out,
        "{} hosts ({} without data), {} records ({} events), {} failed queries{}",
        stats.hosts,
        stats.hosts_without_data,
        stats.records,
        stats.events,
        stats.failures,
        if result.cancelled { ", run cancelled" } else { "" }
    );
    out
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn status_class(status: Status) -> &'static str {
    match status {
        Status::Ok => "ok",
        Status::Warning => "warning",
        Status::Attention => "attention",
        Status::Error => "error",
    }
}

fn bytes_to_gb(bytes: u64) -> f64 {
    (bytes as f64) / 1024.0 / 1024.0 / 1024.0
}

fn html_counts<K: ToString>(out: &mut String, title: &str, rows: &[(K, u64)]) {
    let _ = write!(
        out,
        "<h2>{}</h2>\n<table><tr><th>Key</th><th>Count</th></tr>\n",
        escape_html(title)
    );
    for (key, count) in rows {
        let _ = writeln!(
            out,
            "<tr><td>{}</td><td>{count}</td></tr>",
            escape_html(&key.to_string())
        );
    }
    out.push_str("</table>\n");
}

/// Human-readable report. Reads the result only.
pub fn render_html(result: &FleetRunResult, stats: &AggregateStats, top_n: usize) -> String {
    let mut out = String::new();
    out.push_str(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Fleet report</title>\n\
<style>body{font-family:sans-serif}table{border-collapse:collapse;margin-bottom:1em}\
td,th{border:1px solid #ccc;padding:2px 6px}.warning{background:#fff3cd}\
.attention{background:#ffe0b2}.error{background:#f8d7da}</style></head><body>\n",
    );
    let _ = writeln!(
        out,
        "<h1>Fleet report</h1>\n<p>Started {} &middot; completed {} &middot; {} hosts ({} without data) &middot; {} records &middot; {} failed queries{}</p>",
        format_timestamp(result.started_at),
        format_timestamp(result.completed_at),
        stats.hosts,
        stats.hosts_without_data,
        stats.records,
        stats.failures,
        if result.cancelled { " &middot; cancelled" } else { "" }
    );

    html_counts(&mut out, "Status", &stats.by_status);
    html_counts(&mut out, "Levels", &stats.by_level);
    if !stats.by_failure_kind.is_empty() {
        html_counts(&mut out, "Failure kinds", &stats.by_failure_kind);
    }
    html_counts(&mut out, &format!("Top {top_n} sources"), top(&stats.by_source, top_n));
    html_counts(&mut out, &format!("Top {top_n} event IDs"), top(&stats.by_event_id, top_n));

    if stats.failures > 0 {
        out.push_str("<h2>Failed queries</h2>\n<table><tr><th>Host</th><th>Query</th><th>Kind</th><th>Message</th></tr>\n");
        for (host, failure) in result.failures() {
            let _ = writeln!(
                out,
                "<tr class=\"error\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape_html(host.as_str()),
                escape_html(&failure.query),
                failure.kind,
                escape_html(&failure.message)
            );
        }
        out.push_str("</table>\n");
    }

    for host in &result.hosts {
        let _ = writeln!(out, "<h2>{}</h2>", escape_html(host.host.as_str()));
        let health: Vec<_> = host
            .observations
            .iter()
            .filter_map(|o| match &o.record {
                NormalizedRecord::Health(h) => Some((o, h)),
                NormalizedRecord::LogEvent(_) => None,
            })
            .collect();
        if !health.is_empty() {
            out.push_str("<table><tr><th>Drive</th><th>Disk used</th><th>Free</th><th>Memory used</th><th>Uptime (days)</th><th>Status</th><th>Reasons</th></tr>\n");
            for (o, h) in health {
                let _ = writeln!(
                    out,
                    "<tr class=\"{}\"><td>{}</td><td>{}%</td><td>{:.1} GB of {:.1} GB</td><td>{}%</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                    status_class(o.verdict.status),
                    escape_html(&h.drive_id),
                    h.disk_used_percent,
                    bytes_to_gb(h.disk_free_bytes),
                    bytes_to_gb(h.disk_total_bytes),
                    h.mem_used_percent,
                    h.uptime_days,
                    o.verdict.status,
                    escape_html(&o.verdict.reasons.join("; "))
                );
            }
            out.push_str("</table>\n");
        }

        let events: Vec<_> = host
            .observations
            .iter()
            .filter_map(|o| match &o.record {
                NormalizedRecord::LogEvent(e) => Some((o, e)),
                NormalizedRecord::Health(_) => None,
            })
            .collect();
        if !events.is_empty() {
            out.push_str("<table><tr><th>Time (UTC)</th><th>Log</th><th>Level</th><th>ID</th><th>Source</th><th>Count</th><th>Message</th></tr>\n");
            for (o, e) in events {
                let _ = writeln!(
                    out,
                    "<tr class=\"{}\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                    status_class(o.verdict.status),
                    format_timestamp(e.timestamp),
                    escape_html(&e.log_name),
                    e.level,
                    e.event_id,
                    escape_html(&e.source),
                    o.occurrences,
                    escape_html(&e.message)
                );
            }
            out.push_str("</table>\n");
        }
    }

    out.push_str("</body></html>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{HostCounters, HostResult, QueryFailure};
    use crate::collectors::QueryErrorKind;
    use crate::records::{HostTarget, LogEventRecord, LogLevel, Observation, Verdict};
    use chrono::{TimeZone, Utc};

    fn event(host: &str, level: LogLevel, id: u32, source: &str, occurrences: u32) -> Observation {
        let mut verdict = Verdict::ok();
        if level == LogLevel::Warning {
            verdict.escalate(Status::Warning, "w".to_string());
        }
        Observation {
            record: NormalizedRecord::LogEvent(LogEventRecord {
                host: HostTarget::new(host),
                timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
                log_name: "System".to_string(),
                level,
                event_id: id,
                source: source.to_string(),
                message: "<script>alert(1)</script>".to_string(),
                detail: None,
            }),
            verdict,
            occurrences,
        }
    }

    fn result() -> FleetRunResult {
        let a = vec![
            event("A", LogLevel::Warning, 7, "Disk", 2),
            event("A", LogLevel::Information, 1, "Kernel", 1),
            event("A", LogLevel::Information, 9, "Alpha", 1),
        ];
        let b = vec![event("B", LogLevel::Information, 1, "Kernel", 1)];
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        FleetRunResult {
            hosts: vec![
                HostResult {
                    host: HostTarget::new("A"),
                    counters: HostCounters::recompute(&a, 1, 0),
                    observations: a,
                    query_errors: vec![],
                },
                HostResult {
                    host: HostTarget::new("B"),
                    counters: HostCounters::recompute(&b, 1, 1),
                    observations: b,
                    query_errors: vec![QueryFailure {
                        query: "Application".to_string(),
                        kind: QueryErrorKind::AccessDenied,
                        message: "denied".to_string(),
                    }],
                },
            ],
            started_at: now,
            completed_at: now,
            cancelled: false,
            deduplicated: true,
        }
    }

    #[test]
    fn groupings_sort_by_count_then_key() {
        let stats = summarize(&result());
        assert_eq!(
            stats.by_source,
            vec![
                ("Disk".to_string(), 2),
                ("Kernel".to_string(), 2),
                ("Alpha".to_string(), 1)
            ]
        );
        assert_eq!(stats.by_event_id, vec![(1, 2), (7, 2), (9, 1)]);
        assert_eq!(
            stats.by_status,
            vec![
                ("OK".to_string(), 3),
                ("WARNING".to_string(), 2),
                ("ERROR".to_string(), 1)
            ]
        );
        assert_eq!(stats.records, 4);
        assert_eq!(stats.events, 5);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.hosts_with_failures, 1);
        assert_eq!(stats.by_failure_kind, vec![("AccessDenied".to_string(), 1)]);
    }

    #[test]
    fn summarize_is_repeatable() {
        let r = result();
        assert_eq!(summarize(&r), summarize(&r));
    }

    #[test]
    fn top_never_overruns() {
        let rows = vec![("a".to_string(), 3_u64), ("b".to_string(), 1)];
        assert_eq!(top(&rows, 1).len(), 1);
        assert_eq!(top(&rows, 10).len(), 2);
    }

    #[test]
    fn console_lists_every_failure() {
        let r = result();
        let text = render_console(&r, &summarize(&r), 5);
        assert!(text.contains("FAILED host=B query=Application kind=AccessDenied: denied"));
        assert!(text.contains("2 hosts (0 without data), 4 records (5 events), 1 failed queries"));
    }

    #[test]
    fn console_shows_level_and_failure_kind_counts() {
        let mut r = result();
        r.hosts[1].counters.logs_processed = 0;
        let stats = summarize(&r);
        assert_eq!(
            stats.by_level,
            vec![("Information".to_string(), 3), ("Warning".to_string(), 2)]
        );
        assert_eq!(stats.hosts_without_data, 1);

        let text = render_console(&r, &stats, 5);
        assert!(text.contains("Level"));
        assert!(text.contains("Information"));
        assert!(text.contains("Failure kind"));
        assert!(text.contains("AccessDenied"));
        assert!(text.contains("2 hosts (1 without data)"));

        let html = render_html(&r, &stats, 5);
        assert!(html.contains("<h2>Levels</h2>"));
        assert!(html.contains("<td>Information</td><td>3</td>"));
        assert!(html.contains("<h2>Failure kinds</h2>"));
        assert!(html.contains("(1 without data)"));
    }

    #[test]
    fn html_escapes_messages() {
        let r = result();
        let html = render_html(&r, &summarize(&r), 5);
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("Failed queries"));
    }
}
