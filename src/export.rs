use crate::aggregate::{FleetRunResult, QueryFailure};
use crate::records::{HostTarget, NormalizedRecord, Observation, Status};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const COLUMNS: [&str; 23] = [
    "host",
    "timestamp_utc",
    "kind",
    "status",
    "reasons",
    "occurrences",
    "drive_id",
    "disk_used_percent",
    "disk_free_bytes",
    "disk_total_bytes",
    "mem_used_percent",
    "mem_free_bytes",
    "mem_total_bytes",
    "uptime_days",
    "last_boot_utc",
    "log_name",
    "level",
    "event_id",
    "source",
    "message",
    "process_id",
    "thread_id",
    "user_id",
];

pub const REASON_SEPARATOR: &str = "; ";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot encode {path}: {source}")]
    Csv { path: String, source: csv::Error },
    #[error("cannot encode metrics for {path}: {source}")]
    Metrics {
        path: String,
        source: prometheus::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Health,
    Event,
    Failure,
}

/// One line of the export. Fields that do not apply to the row's kind are
/// left empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub host: String,
    pub timestamp_utc: String,
    pub kind: RowKind,
    pub status: String,
    pub reasons: String,
    pub occurrences: u32,
    pub drive_id: Option<String>,
    pub disk_used_percent: Option<f64>,
    pub disk_free_bytes: Option<u64>,
    pub disk_total_bytes: Option<u64>,
    pub mem_used_percent: Option<f64>,
    pub mem_free_bytes: Option<u64>,
    pub mem_total_bytes: Option<u64>,
    pub uptime_days: Option<f64>,
    pub last_boot_utc: Option<String>,
    pub log_name: Option<String>,
    pub level: Option<String>,
    pub event_id: Option<u32>,
    pub source: Option<String>,
    pub message: Option<String>,
    pub process_id: Option<u32>,
    pub thread_id: Option<u32>,
    pub user_id: Option<String>,
}

impl ExportRow {
    fn empty(host: &HostTarget, timestamp: DateTime<Utc>, kind: RowKind, status: Status) -> Self {
        Self {
            host: host.to_string(),
            timestamp_utc: format_timestamp(timestamp),
            kind,
            status: status.as_str().to_string(),
            reasons: String::new(),
            occurrences: 1,
            drive_id: None,
            disk_used_percent: None,
            disk_free_bytes: None,
            disk_total_bytes: None,
            mem_used_percent: None,
            mem_free_bytes: None,
            mem_total_bytes: None,
            uptime_days: None,
            last_boot_utc: None,
            log_name: None,
            level: None,
            event_id: None,
            source: None,
            message: None,
            process_id: None,
            thread_id: None,
            user_id: None,
        }
    }

    pub fn from_observation(observation: &Observation) -> Self {
        let record = &observation.record;
        let mut row = Self::empty(
            record.host(),
            record.timestamp(),
            RowKind::Health,
            observation.verdict.status,
        );
        row.reasons = observation.verdict.reasons.join(REASON_SEPARATOR);
        row.occurrences = observation.occurrences;
        match record {
            NormalizedRecord::Health(h) => {
                row.drive_id = Some(h.drive_id.clone());
                row.disk_used_percent = Some(h.disk_used_percent);
                row.disk_free_bytes = Some(h.disk_free_bytes);
                row.disk_total_bytes = Some(h.disk_total_bytes);
                row.mem_used_percent = Some(h.mem_used_percent);
                row.mem_free_bytes = Some(h.mem_free_bytes);
                row.mem_total_bytes = Some(h.mem_total_bytes);
                row.uptime_days = Some(h.uptime_days);
                row.last_boot_utc = h.last_boot.map(format_timestamp);
            }
            NormalizedRecord::LogEvent(e) => {
                row.kind = RowKind::Event;
                row.log_name = Some(e.log_name.clone());
                row.level = Some(e.level.as_str().to_string());
                row.event_id = Some(e.event_id);
                row.source = Some(e.source.clone());
                row.message = Some(e.message.clone());
                if let Some(detail) = &e.detail {
                    row.process_id = detail.process_id;
                    row.thread_id = detail.thread_id;
                    row.user_id = Some(detail.user_id.clone());
                }
            }
        }
        row
    }

    /// Transport failures are the only rows that carry ERROR.
    pub fn from_failure(host: &HostTarget, failure: &QueryFailure, at: DateTime<Utc>) -> Self {
        let mut row = Self::empty(host, at, RowKind::Failure, Status::Error);
        row.reasons = format!("{}: {}", failure.kind, failure.message);
        row.log_name = Some(failure.query.clone());
        row
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Rows in export order: per host, its records then its failures.
pub fn rows(result: &FleetRunResult) -> Vec<ExportRow> {
    let mut out = Vec::with_capacity(result.total_records());
    for host in &result.hosts {
        out.extend(host.observations.iter().map(ExportRow::from_observation));
        out.extend(
            host.query_errors
                .iter()
                .map(|f| ExportRow::from_failure(&host.host, f, result.completed_at)),
        );
    }
    out
}

pub fn export(result: &FleetRunResult, path: &Path) -> Result<usize, ExportError> {
    let path_display = path.display().to_string();
    let file = File::create(path).map_err(|source| ExportError::Io {
        path: path_display.clone(),
        source,
    })?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    let csv_err = |source| ExportError::Csv {
        path: path_display.clone(),
        source,
    };

    writer.write_record(COLUMNS).map_err(csv_err)?;
    let rows = rows(result);
    for row in &rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| ExportError::Io {
        path: path_display.clone(),
        source,
    })?;
    info!(path = %path_display, rows = rows.len(), "export written");
    Ok(rows.len())
}

pub fn read_export(path: &Path) -> Result<Vec<ExportRow>, ExportError> {
    let path_display = path.display().to_string();
    let mut reader = csv::Reader::from_path(path).map_err(|source| ExportError::Csv {
        path: path_display.clone(),
        source,
    })?;
    reader
        .deserialize()
        .collect::<Result<Vec<ExportRow>, _>>()
        .map_err(|source| ExportError::Csv {
            path: path_display,
            source,
        })
}

pub fn html_report_path(output: &Path) -> PathBuf {
    output.with_extension("html")
}
