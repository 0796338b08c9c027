use super::{cap, HostQuery, QueryError, QueryErrorKind, QuerySpec};
use crate::records::{HealthSample, HostTarget, RawLogEvent, RawRecord};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

/// Replays captured host data from `<dir>/<host>.yaml`.
pub struct FixtureAdapter {
    dir: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct HostFixture {
    #[serde(default)]
    pub health: Vec<HealthSample>,
    #[serde(default)]
    pub logs: HashMap<String, Vec<RawLogEvent>>,
    /// Query label to failure kind, for simulating broken hosts.
    #[serde(default)]
    pub failures: HashMap<String, QueryErrorKind>,
}

impl FixtureAdapter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load(&self, host: &HostTarget) -> Result<HostFixture, QueryError> {
        let path = self.dir.join(format!("{host}.yaml"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(QueryError::unreachable(format!(
                    "no capture for host at {}",
                    path.display()
                )))
            }
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                return Err(QueryError::new(
                    QueryErrorKind::AccessDenied,
                    format!("{}: {err}", path.display()),
                ))
            }
            Err(err) => {
                return Err(QueryError::unreachable(format!(
                    "{}: {err}",
                    path.display()
                )))
            }
        };
        serde_yaml::from_str(&text).map_err(|err| {
            QueryError::unsupported(format!("capture {} is malformed: {err}", path.display()))
        })
    }
}

#[async_trait]
impl HostQuery for FixtureAdapter {
    async fn query(
        &self,
        host: &HostTarget,
        spec: &QuerySpec,
    ) -> Result<Vec<RawRecord>, QueryError> {
        let mut fixture = self.load(host).await?;
        if let Some(kind) = fixture.failures.get(spec.label()) {
            return Err(QueryError::new(
                *kind,
                format!("capture marks '{}' as failed", spec.label()),
            ));
        }

        let records = match spec {
            QuerySpec::Health(q) => cap(
                fixture
                    .health
                    .into_iter()
                    .map(RawRecord::HealthSample)
                    .collect(),
                q.max_records,
            ),
            QuerySpec::Log(q) => {
                let events = fixture.logs.remove(&q.log_name).ok_or_else(|| {
                    QueryError::unsupported(format!("log '{}' not present on {host}", q.log_name))
                })?;
                q.select(events)
            }
        };
        debug!(host = %host, query = %spec.label(), records = records.len(), "fixture replayed");
        Ok(records)
    }
}
