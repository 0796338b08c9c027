mod aggregate;
mod classify;
mod collectors;
mod config;
mod export;
mod metrics;
mod normalize;
mod records;
mod report;

use aggregate::{Aggregator, FleetRunResult};
use chrono::Utc;
use clap::Parser;
use collectors::agent::AgentAdapter;
use collectors::fixture::FixtureAdapter;
use collectors::system::LocalAdapter;
use collectors::HostQuery;
use config::{AdapterConfig, Config, ConfigError};
use export::ExportError;
use normalize::Normalizer;
use records::LogLevel;
use report::AggregateStats;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_EXPORT_FAILED: i32 = 1;
const EXIT_STARTUP_FAILED: i32 = 1;
const EXIT_BAD_CONFIG: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "fleetwatch")]
#[command(version)]
#[command(about = "Collects health and event-log records from a fleet of hosts into one report")]
struct Cli {
    /// YAML configuration file; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,
    /// Look-back window in hours.
    #[arg(long)]
    hours: Option<u64>,
    #[arg(long, value_delimiter = ',')]
    logs: Vec<String>,
    #[arg(long, value_enum, value_delimiter = ',')]
    levels: Vec<LogLevel>,
    #[arg(long, value_delimiter = ',')]
    event_ids: Vec<u32>,
    #[arg(long)]
    max_records: Option<usize>,
    #[arg(long)]
    message_cap: Option<usize>,
    /// Skip the per-host health query.
    #[arg(long)]
    no_health: bool,
    #[arg(long)]
    disk_threshold: Option<f64>,
    #[arg(long)]
    memory_threshold: Option<f64>,
    #[arg(long)]
    stale_boot_days: Option<f64>,
    /// Include process, thread and user on event rows.
    #[arg(long)]
    detailed: bool,
    /// Collapse repeated events into one row with an occurrence count.
    #[arg(long)]
    dedup: bool,
    #[arg(long, short)]
    output: Option<PathBuf>,
    #[arg(long)]
    html_report: bool,
    #[arg(long)]
    metrics_path: Option<PathBuf>,
    #[arg(long)]
    top: Option<usize>,
    #[arg(long, short = 'j')]
    parallelism: Option<usize>,
    /// Per-query timeout, e.g. `30s`.
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
    /// Whole-run deadline, e.g. `5m`.
    #[arg(long, value_parser = humantime::parse_duration)]
    deadline: Option<Duration>,
    /// Total attempts per query for unreachable or timed out hosts.
    #[arg(long)]
    attempts: Option<u32>,
    /// TCP reachability check before querying a host.
    #[arg(long)]
    probe: bool,
    /// Replay `<dir>/<host>.yaml` captures instead of querying hosts.
    #[arg(long, conflicts_with = "agent_port")]
    fixture_dir: Option<PathBuf>,
    /// Query the HTTP collection agent on this port.
    #[arg(long)]
    agent_port: Option<u16>,
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    let started_at = Utc::now();
    let hosts = cfg.host_targets();
    let specs = cfg.query_specs(started_at);
    info!(
        hosts = hosts.len(),
        queries_per_host = specs.len(),
        adapter = adapter_name(&cfg.adapter),
        output = %cfg.output.display(),
        "starting fleetwatch"
    );

    let adapter = match build_adapter(&cfg) {
        Ok(adapter) => adapter,
        Err(err) => {
            error!(error = %err, "failed to build the query adapter");
            std::process::exit(EXIT_STARTUP_FAILED);
        }
    };
    let aggregator = Aggregator::new(
        adapter,
        Normalizer::new(cfg.message_cap, cfg.detailed),
        Box::new(cfg.thresholds),
        cfg.run_options(),
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctrl_c_task = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            return;
        }
        warn!("Ctrl+C received, cancelling outstanding queries");
        let _ = cancel_tx.send(true);
    });

    let result = aggregator.run(&hosts, &specs, cancel_rx).await;
    ctrl_c_task.abort();

    let stats = report::summarize(&result);
    println!("{}", report::render_console(&result, &stats, cfg.top));

    if let Err(err) = write_outputs(&cfg, &result, &stats) {
        error!(error = %err, "failed to write report");
        std::process::exit(EXIT_EXPORT_FAILED);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut cfg, cli);
    cfg.validate()?;
    Ok(cfg)
}

fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    if !cli.hosts.is_empty() {
        cfg.hosts = cli.hosts.clone();
    }
    if let Some(hours) = cli.hours {
        cfg.hours = hours;
    }
    if !cli.logs.is_empty() {
        cfg.logs = cli.logs.clone();
    }
    if !cli.levels.is_empty() {
        cfg.levels = cli.levels.clone();
    }
    if !cli.event_ids.is_empty() {
        cfg.event_ids = cli.event_ids.clone();
    }
    if let Some(v) = cli.max_records {
        cfg.max_records = v;
    }
    if let Some(v) = cli.message_cap {
        cfg.message_cap = v;
    }
    if cli.no_health {
        cfg.health = false;
    }
    if let Some(v) = cli.disk_threshold {
        cfg.thresholds.disk_percent = v;
    }
    if let Some(v) = cli.memory_threshold {
        cfg.thresholds.memory_percent = v;
    }
    if let Some(v) = cli.stale_boot_days {
        cfg.thresholds.stale_boot_days = v;
    }
    cfg.detailed |= cli.detailed;
    cfg.dedup |= cli.dedup;
    cfg.html_report |= cli.html_report;
    cfg.probe.enabled |= cli.probe;
    if let Some(path) = &cli.output {
        cfg.output = path.clone();
    }
    if let Some(path) = &cli.metrics_path {
        cfg.metrics_path = Some(path.clone());
    }
    if let Some(v) = cli.top {
        cfg.top = v;
    }
    if let Some(v) = cli.parallelism {
        cfg.parallelism = v;
    }
    if let Some(v) = cli.timeout {
        cfg.query_timeout = v;
    }
    if let Some(v) = cli.deadline {
        cfg.deadline = Some(v);
    }
    if let Some(v) = cli.attempts {
        cfg.retry.attempts = v;
    }
    if let Some(dir) = &cli.fixture_dir {
        cfg.adapter = AdapterConfig::Fixture { dir: dir.clone() };
    } else if let Some(port) = cli.agent_port {
        let scheme = match &cfg.adapter {
            AdapterConfig::Agent { scheme, .. } => scheme.clone(),
            _ => "http".to_string(),
        };
        cfg.adapter = AdapterConfig::Agent { port, scheme };
    }
}

fn build_adapter(cfg: &Config) -> Result<Arc<dyn HostQuery>, reqwest::Error> {
    let adapter: Arc<dyn HostQuery> = match &cfg.adapter {
        AdapterConfig::Local => Arc::new(LocalAdapter::new()),
        AdapterConfig::Agent { port, scheme } => {
            Arc::new(AgentAdapter::new(scheme, *port, cfg.query_timeout)?)
        }
        AdapterConfig::Fixture { dir } => Arc::new(FixtureAdapter::new(dir.clone())),
    };
    Ok(adapter)
}

fn adapter_name(adapter: &AdapterConfig) -> &'static str {
    match adapter {
        AdapterConfig::Local => "local",
        AdapterConfig::Agent { .. } => "agent",
        AdapterConfig::Fixture { .. } => "fixture",
    }
}

fn write_outputs(
    cfg: &Config,
    result: &FleetRunResult,
    stats: &AggregateStats,
) -> Result<(), ExportError> {
    export::export(result, &cfg.output)?;

    if cfg.html_report {
        let path = export::html_report_path(&cfg.output);
        let html = report::render_html(result, stats, cfg.top);
        std::fs::write(&path, html).map_err(|source| ExportError::Io {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "html report written");
    }

    if let Some(path) = &cfg.metrics_path {
        metrics::write_textfile(result, path)?;
    }
    Ok(())
}
