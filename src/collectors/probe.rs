use crate::records::HostTarget;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub detail: Option<String>,
}

/// TCP connect to the host's management port. Used as the reachability
/// check before any query is issued.
pub async fn probe_host(host: &HostTarget, port: u16, timeout: Duration) -> ProbeOutcome {
    let start = Instant::now();
    let addr = host.authority(port);

    let detail = match time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => None,
        Ok(Err(err)) => {
            warn!(host = %host, address = %addr, error = %err, "probe failed");
            Some(err.to_string())
        }
        Err(_elapsed) => {
            warn!(host = %host, address = %addr, "probe timeout");
            Some(format!("no answer on {addr} within {}", humantime::format_duration(timeout)))
        }
    };
    let latency_ms = start.elapsed().as_millis() as u64;
    debug!(host = %host, latency_ms, reachable = detail.is_none(), "probe finished");

    ProbeOutcome {
        reachable: detail.is_none(),
        detail,
    }
}
