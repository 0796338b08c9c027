use crate::aggregate::FleetRunResult;
use crate::export::ExportError;
use prometheus::core::Collector;
use prometheus::{opts, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::fs;
use std::path::Path;
use tracing::info;

/// Run outcome in Prometheus text format, for the node exporter textfile
/// collector.
pub struct RunMetrics {
    registry: Registry,
    pub fleet_hosts_total: Gauge,
    pub fleet_records: GaugeVec,
    pub fleet_events: GaugeVec,
    pub fleet_queries_processed: GaugeVec,
    pub fleet_query_failures: GaugeVec,
    pub fleet_run_duration_seconds: Gauge,
    pub fleet_run_completed_timestamp_seconds: Gauge,
    pub fleet_run_cancelled: Gauge,
}

impl RunMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let fleet_hosts_total =
            Gauge::with_opts(opts!("fleet_hosts_total", "Hosts targeted by the run"))?;
        let fleet_records = GaugeVec::new(
            opts!("fleet_records", "Stored records by host and verdict status"),
            &["host", "status"],
        )?;
        let fleet_events = GaugeVec::new(
            opts!(
                "fleet_events",
                "Observed events by host and verdict status, counting collapsed duplicates"
            ),
            &["host", "status"],
        )?;
        let fleet_queries_processed = GaugeVec::new(
            opts!("fleet_queries_processed", "Successful queries by host"),
            &["host"],
        )?;
        let fleet_query_failures = GaugeVec::new(
            opts!("fleet_query_failures", "Failed queries by host and failure kind"),
            &["host", "kind"],
        )?;
        let fleet_run_duration_seconds = Gauge::with_opts(opts!(
            "fleet_run_duration_seconds",
            "Wall time between run start and completion"
        ))?;
        let fleet_run_completed_timestamp_seconds = Gauge::with_opts(opts!(
            "fleet_run_completed_timestamp_seconds",
            "Unix time the run completed"
        ))?;
        let fleet_run_cancelled = Gauge::with_opts(opts!(
            "fleet_run_cancelled",
            "1 when the run was cut short by cancellation"
        ))?;

        register(&registry, &fleet_hosts_total)?;
        register(&registry, &fleet_records)?;
        register(&registry, &fleet_events)?;
        register(&registry, &fleet_queries_processed)?;
        register(&registry, &fleet_query_failures)?;
        register(&registry, &fleet_run_duration_seconds)?;
        register(&registry, &fleet_run_completed_timestamp_seconds)?;
        register(&registry, &fleet_run_cancelled)?;

        Ok(Self {
            registry,
            fleet_hosts_total,
            fleet_records,
            fleet_events,
            fleet_queries_processed,
            fleet_query_failures,
            fleet_run_duration_seconds,
            fleet_run_completed_timestamp_seconds,
            fleet_run_cancelled,
        })
    }

    pub fn update_from_result(&self, result: &FleetRunResult) {
        self.fleet_hosts_total.set(result.hosts.len() as f64);
        for host in &result.hosts {
            let name = host.host.as_str();
            for observation in &host.observations {
                let status = observation.verdict.status.as_str();
                self.fleet_records.with_label_values(&[name, status]).inc();
                self.fleet_events
                    .with_label_values(&[name, status])
                    .add(f64::from(observation.occurrences));
            }
            self.fleet_queries_processed
                .with_label_values(&[name])
                .set(host.counters.logs_processed as f64);
            for failure in &host.query_errors {
                self.fleet_query_failures
                    .with_label_values(&[name, failure.kind.as_str()])
                    .inc();
            }
        }
        let duration = result
            .completed_at
            .signed_duration_since(result.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        self.fleet_run_duration_seconds.set(duration);
        self.fleet_run_completed_timestamp_seconds
            .set(result.completed_at.timestamp() as f64);
        self.fleet_run_cancelled
            .set(if result.cancelled { 1.0 } else { 0.0 });
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

/// Writes through a temporary file and renames, so a scraping collector
/// never reads a half-written file.
pub fn write_textfile(result: &FleetRunResult, path: &Path) -> Result<(), ExportError> {
    let path_display = path.display().to_string();
    let metrics_err = |source| ExportError::Metrics {
        path: path_display.clone(),
        source,
    };
    let metrics = RunMetrics::new().map_err(metrics_err)?;
    metrics.update_from_result(result);
    let body = metrics.encode_metrics().map_err(metrics_err)?;

    let tmp = path.with_extension("prom.tmp");
    fs::write(&tmp, body)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|source| ExportError::Io {
            path: path_display.clone(),
            source,
        })?;
    info!(path = %path_display, "metrics textfile written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{HostCounters, HostResult, QueryFailure};
    use crate::collectors::QueryErrorKind;
    use crate::records::HostTarget;
    use chrono::{Duration, TimeZone, Utc};

    fn result() -> FleetRunResult {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        FleetRunResult {
            hosts: vec![HostResult {
                host: HostTarget::new("B"),
                observations: vec![],
                query_errors: vec![QueryFailure {
                    query: "System".to_string(),
                    kind: QueryErrorKind::Unreachable,
                    message: "refused".to_string(),
                }],
                counters: HostCounters {
                    logs_skipped: 1,
                    ..HostCounters::default()
                },
            }],
            started_at: start,
            completed_at: start + Duration::milliseconds(1500),
            cancelled: false,
            deduplicated: false,
        }
    }

    #[test]
    fn encodes_failures_and_duration() {
        let metrics = RunMetrics::new().expect("metrics registry");
        metrics.update_from_result(&result());
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("fleet_query_failures{host=\"B\",kind=\"Unreachable\"} 1"));
        assert!(text.contains("fleet_run_duration_seconds 1.5"));
        assert!(text.contains("fleet_hosts_total 1"));
    }

    #[test]
    fn textfile_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.prom");
        write_textfile(&result(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("fleet_run_cancelled 0"));
        assert!(!dir.path().join("fleet.prom.tmp").exists());
    }
}
