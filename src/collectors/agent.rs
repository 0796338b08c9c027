use super::{cap, HostQuery, QueryError, QueryErrorKind, QuerySpec};
use crate::records::{HostTarget, RawRecord};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};

/// Talks to a lightweight collection agent on each host. The agent serves
/// `GET /health` and `GET /events` as JSON arrays of raw records.
pub struct AgentAdapter {
    client: Client,
    scheme: String,
    port: u16,
}

impl AgentAdapter {
    pub fn new(scheme: &str, port: u16, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("fleetwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            scheme: scheme.to_string(),
            port,
        })
    }

    pub fn endpoint(&self, host: &HostTarget, spec: &QuerySpec) -> Result<Url, QueryError> {
        let base = format!("{}://{}", self.scheme, host.authority(self.port));
        let mut url = Url::parse(&base)
            .map_err(|err| QueryError::unreachable(format!("invalid agent address {base}: {err}")))?;
        match spec {
            QuerySpec::Health(q) => {
                url.set_path("/health");
                url.query_pairs_mut()
                    .append_pair("max", &q.max_records.to_string());
            }
            QuerySpec::Log(q) => {
                url.set_path("/events");
                let levels = q
                    .levels
                    .iter()
                    .map(|l| l.code().to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let mut pairs = url.query_pairs_mut();
                pairs
                    .append_pair("log", &q.log_name)
                    .append_pair("since", &q.since.to_rfc3339())
                    .append_pair("levels", &levels)
                    .append_pair("max", &q.max_records.to_string());
                if let Some(ids) = &q.event_ids {
                    let ids = ids
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    pairs.append_pair("event_ids", &ids);
                }
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl HostQuery for AgentAdapter {
    async fn query(
        &self,
        host: &HostTarget,
        spec: &QuerySpec,
    ) -> Result<Vec<RawRecord>, QueryError> {
        let url = self.endpoint(host, spec)?;
        let resp = self.client.get(url.clone()).send().await.map_err(|err| {
            warn!(host = %host, url = %url, error = %err, "agent request failed");
            translate_transport_error(&err)
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(QueryError::new(
                kind_for_status(status),
                format!("agent answered {status} for {}", spec.label()),
            ));
        }

        let records: Vec<RawRecord> = resp.json().await.map_err(|err| {
            if err.is_timeout() {
                translate_transport_error(&err)
            } else {
                QueryError::unsupported(format!("agent sent an unreadable body: {err}"))
            }
        })?;
        debug!(host = %host, query = %spec.label(), records = records.len(), "agent query finished");
        let records = match spec {
            QuerySpec::Log(q) => q.select(records.into_iter().filter_map(|r| match r {
                RawRecord::LogEvent(e) => Some(e),
                RawRecord::HealthSample(_) => None,
            })),
            QuerySpec::Health(_) => records
                .into_iter()
                .filter(|r| matches!(r, RawRecord::HealthSample(_)))
                .collect(),
        };
        Ok(cap(records, spec.max_records()))
    }
}

fn translate_transport_error(err: &reqwest::Error) -> QueryError {
    if err.is_timeout() {
        QueryError::new(QueryErrorKind::Timeout, err.to_string())
    } else {
        QueryError::unreachable(err.to_string())
    }
}

fn kind_for_status(status: StatusCode) -> QueryErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => QueryErrorKind::AccessDenied,
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
            QueryErrorKind::Unsupported
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => QueryErrorKind::Timeout,
        _ => QueryErrorKind::Unreachable,
    }
}
