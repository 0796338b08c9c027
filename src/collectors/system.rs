use super::{cap, HostQuery, QueryError, QuerySpec};
use crate::records::{HealthSample, HostTarget, RawRecord};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sysinfo::{DiskExt, System, SystemExt};
use tracing::debug;

const LOCAL_ALIASES: [&str; 4] = ["localhost", "127.0.0.1", "::1", "."];

/// Health of the machine the tool runs on, read through sysinfo.
/// Event logs are not available through this adapter.
pub struct LocalAdapter {
    host_name: Option<String>,
}

#[derive(Debug, Clone)]
struct DiskReading {
    mount: String,
    total_bytes: u64,
    available_bytes: u64,
}

impl LocalAdapter {
    pub fn new() -> Self {
        let system = System::new();
        Self {
            host_name: system.host_name(),
        }
    }

    pub fn is_local(&self, host: &HostTarget) -> bool {
        let name = host.as_str().trim();
        LOCAL_ALIASES.iter().any(|a| a.eq_ignore_ascii_case(name))
            || self
                .host_name
                .as_deref()
                .is_some_and(|own| own.eq_ignore_ascii_case(name))
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostQuery for LocalAdapter {
    async fn query(
        &self,
        host: &HostTarget,
        spec: &QuerySpec,
    ) -> Result<Vec<RawRecord>, QueryError> {
        if !self.is_local(host) {
            return Err(QueryError::unsupported(format!(
                "local adapter cannot query remote host {host}"
            )));
        }
        match spec {
            QuerySpec::Health(q) => {
                let samples = tokio::task::spawn_blocking(collect_local_health)
                    .await
                    .map_err(|err| QueryError::unreachable(format!("health collector failed: {err}")))?;
                debug!(host = %host, disks = samples.len(), "local health collected");
                Ok(cap(samples, q.max_records))
            }
            QuerySpec::Log(q) => Err(QueryError::unsupported(format!(
                "event log '{}' is not readable through the local adapter",
                q.log_name
            ))),
        }
    }
}

fn collect_local_health() -> Vec<RawRecord> {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_disks_list();
    system.refresh_disks();

    let disks: Vec<DiskReading> = system
        .disks()
        .iter()
        .filter(|d| !d.is_removable())
        .map(|d| DiskReading {
            mount: d.mount_point().to_string_lossy().to_string(),
            total_bytes: d.total_space(),
            available_bytes: d.available_space(),
        })
        .collect();

    let last_boot = Utc.timestamp_opt(system.boot_time() as i64, 0).single();
    build_samples(
        disks,
        system.total_memory(),
        system.available_memory(),
        last_boot,
    )
}

fn build_samples(
    disks: Vec<DiskReading>,
    mem_total_bytes: u64,
    mem_free_bytes: u64,
    last_boot: Option<DateTime<Utc>>,
) -> Vec<RawRecord> {
    disks
        .into_iter()
        .filter(|d| d.total_bytes > 0)
        .map(|d| {
            RawRecord::HealthSample(HealthSample {
                drive_id: Some(drive_id_from_mount(&d.mount)),
                disk_total_bytes: Some(d.total_bytes),
                disk_free_bytes: Some(d.available_bytes),
                mem_total_bytes: Some(mem_total_bytes),
                mem_free_bytes: Some(mem_free_bytes),
                last_boot,
            })
        })
        .collect()
}

/// `C:\` becomes `C:`; unix mount points are kept as is.
fn drive_id_from_mount(mount: &str) -> String {
    let trimmed = mount.trim_end_matches('\\');
    if trimmed.is_empty() {
        mount.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::HealthQuery;

    #[test]
    fn drive_ids_drop_trailing_backslash() {
        assert_eq!(drive_id_from_mount("C:\\"), "C:");
        assert_eq!(drive_id_from_mount("/"), "/");
        assert_eq!(drive_id_from_mount("/var"), "/var");
    }

    #[test]
    fn samples_skip_empty_disks_and_share_os_counters() {
        let disks = vec![
            DiskReading {
                mount: "C:\\".to_string(),
                total_bytes: 100,
                available_bytes: 40,
            },
            DiskReading {
                mount: "D:\\".to_string(),
                total_bytes: 0,
                available_bytes: 0,
            },
        ];
        let samples = build_samples(disks, 1000, 250, None);
        assert_eq!(samples.len(), 1);
        match &samples[0] {
            RawRecord::HealthSample(s) => {
                assert_eq!(s.drive_id.as_deref(), Some("C:"));
                assert_eq!(s.mem_total_bytes, Some(1000));
                assert_eq!(s.mem_free_bytes, Some(250));
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_hosts_are_unsupported() {
        let adapter = LocalAdapter {
            host_name: Some("me".to_string()),
        };
        let err = adapter
            .query(
                &HostTarget::new("far-away"),
                &QuerySpec::Health(HealthQuery { max_records: 10 }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::collectors::QueryErrorKind::Unsupported);
        assert!(adapter.is_local(&HostTarget::new("ME")));
        assert!(adapter.is_local(&HostTarget::new("localhost")));
    }
}
