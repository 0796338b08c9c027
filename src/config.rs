use crate::aggregate::{ProbeSettings, RetryPolicy, RunOptions};
use crate::classify::Thresholds;
use crate::collectors::{HealthQuery, LogQuery, QuerySpec};
use crate::export::html_report_path;
use crate::records::{HostTarget, LogLevel};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// A century of look-back; keeps `started_at - hours` inside chrono's range.
const MAX_HOURS: u64 = 24 * 365 * 100;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_hours")]
    pub hours: u64,
    #[serde(default = "default_logs")]
    pub logs: Vec<String>,
    #[serde(default = "default_levels")]
    pub levels: Vec<LogLevel>,
    #[serde(default)]
    pub event_ids: Vec<u32>,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_message_cap")]
    pub message_cap: usize,
    #[serde(default = "default_health")]
    pub health: bool,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub detailed: bool,
    #[serde(default)]
    pub dedup: bool,
    #[serde(default = "default_output")]
    pub output: PathBuf,
    #[serde(default)]
    pub html_report: bool,
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
    #[serde(default = "default_top")]
    pub top: usize,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_query_timeout", with = "duration_text")]
    pub query_timeout: Duration,
    #[serde(default, with = "optional_duration_text")]
    pub deadline: Option<Duration>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_backoff", with = "duration_text")]
    pub backoff: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_probe_port")]
    pub port: u16,
    #[serde(default = "default_probe_timeout", with = "duration_text")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AdapterConfig {
    #[default]
    Local,
    Agent {
        #[serde(default = "default_agent_port")]
        port: u16,
        #[serde(default = "default_agent_scheme")]
        scheme: String,
    },
    Fixture {
        dir: PathBuf,
    },
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            backoff: default_retry_backoff(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_probe_port(),
            timeout: default_probe_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            hours: default_hours(),
            logs: default_logs(),
            levels: default_levels(),
            event_ids: Vec::new(),
            max_records: default_max_records(),
            message_cap: default_message_cap(),
            health: default_health(),
            thresholds: Thresholds::default(),
            detailed: false,
            dedup: false,
            output: default_output(),
            html_report: false,
            metrics_path: None,
            top: default_top(),
            parallelism: default_parallelism(),
            query_timeout: default_query_timeout(),
            deadline: None,
            retry: RetryConfig::default(),
            probe: ProbeConfig::default(),
            adapter: AdapterConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    /// Parses the file only; callers apply overrides and then `validate`.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_hosts(&self.hosts)?;
        validate_thresholds(&self.thresholds)?;

        if !(1..=MAX_HOURS).contains(&self.hours) {
            return Err(ConfigError::Validation(format!(
                "hours must be in 1..={MAX_HOURS}"
            )));
        }
        if !self.health && self.logs.is_empty() {
            return Err(ConfigError::Validation(
                "nothing to query: health is disabled and no logs are listed".to_string(),
            ));
        }
        if self.logs.iter().any(|l| l.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "logs[*] must not be empty".to_string(),
            ));
        }
        if !self.logs.is_empty() && self.levels.is_empty() {
            return Err(ConfigError::Validation(
                "levels must name at least one level when logs are queried".to_string(),
            ));
        }
        if self.max_records == 0 {
            return Err(ConfigError::Validation(
                "max_records must be > 0".to_string(),
            ));
        }
        if self.message_cap == 0 {
            return Err(ConfigError::Validation(
                "message_cap must be > 0".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(ConfigError::Validation(
                "parallelism must be >= 1".to_string(),
            ));
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "query_timeout must be > 0".to_string(),
            ));
        }
        if self.deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Validation(
                "deadline must be > 0 when set".to_string(),
            ));
        }
        if self.retry.attempts < 1 {
            return Err(ConfigError::Validation(
                "retry.attempts must be >= 1".to_string(),
            ));
        }
        if self.probe.enabled && (self.probe.port == 0 || self.probe.timeout.is_zero()) {
            return Err(ConfigError::Validation(
                "probe.port must be in 1..65535 and probe.timeout > 0".to_string(),
            ));
        }
        match &self.adapter {
            AdapterConfig::Local => {}
            AdapterConfig::Agent { port, scheme } => {
                if *port == 0 {
                    return Err(ConfigError::Validation(
                        "adapter.port must be in 1..65535".to_string(),
                    ));
                }
                if scheme != "http" && scheme != "https" {
                    return Err(ConfigError::Validation(format!(
                        "adapter.scheme '{scheme}' must be http or https"
                    )));
                }
            }
            AdapterConfig::Fixture { dir } => {
                if !dir.is_dir() {
                    return Err(ConfigError::Validation(format!(
                        "adapter.dir {} is not a directory",
                        dir.display()
                    )));
                }
            }
        }

        check_writable(&self.output)?;
        if self.html_report {
            check_writable(&html_report_path(&self.output))?;
        }
        if let Some(path) = &self.metrics_path {
            check_writable(path)?;
        }
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }

    pub fn host_targets(&self) -> Vec<HostTarget> {
        self.hosts
            .iter()
            .map(|h| HostTarget::new(h.trim()))
            .collect()
    }

    /// Health first, then each log in configured order.
    pub fn query_specs(&self, started_at: DateTime<Utc>) -> Vec<QuerySpec> {
        let mut specs = Vec::with_capacity(self.logs.len() + 1);
        if self.health {
            specs.push(QuerySpec::Health(HealthQuery {
                max_records: self.max_records,
            }));
        }
        let since = started_at - ChronoDuration::hours(self.hours as i64);
        let event_ids = (!self.event_ids.is_empty())
            .then(|| self.event_ids.iter().copied().collect());
        for log in &self.logs {
            specs.push(QuerySpec::Log(LogQuery {
                log_name: log.trim().to_string(),
                since,
                levels: self.levels.iter().copied().collect(),
                event_ids: event_ids.clone(),
                max_records: self.max_records,
            }));
        }
        specs
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            parallelism: self.parallelism,
            query_timeout: self.query_timeout,
            retry: RetryPolicy {
                attempts: self.retry.attempts,
                backoff: self.retry.backoff,
            },
            deadline: self.deadline,
            dedup: self.dedup,
            probe: self.probe.enabled.then_some(ProbeSettings {
                port: self.probe.port,
                timeout: self.probe.timeout,
            }),
        }
    }
}

fn validate_hosts(hosts: &[String]) -> Result<(), ConfigError> {
    if hosts.is_empty() {
        return Err(ConfigError::Validation(
            "hosts must list at least one host".to_string(),
        ));
    }
    let mut names = HashSet::new();
    for host in hosts {
        let name = host.trim();
        if name.is_empty() {
            return Err(ConfigError::Validation(
                "hosts[*] must not be empty".to_string(),
            ));
        }
        if !names.insert(name.to_ascii_lowercase()) {
            return Err(ConfigError::Validation(format!(
                "host '{name}' is listed more than once"
            )));
        }
    }
    Ok(())
}

fn validate_thresholds(t: &Thresholds) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&t.disk_percent) {
        return Err(ConfigError::Validation(
            "thresholds.disk_percent must be in 0..100".to_string(),
        ));
    }
    if !(0.0..=100.0).contains(&t.memory_percent) {
        return Err(ConfigError::Validation(
            "thresholds.memory_percent must be in 0..100".to_string(),
        ));
    }
    if t.stale_boot_days.is_nan() || t.stale_boot_days <= 0.0 {
        return Err(ConfigError::Validation(
            "thresholds.stale_boot_days must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn check_writable(path: &Path) -> Result<(), ConfigError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let meta = fs::metadata(parent).map_err(|err| {
        ConfigError::Validation(format!(
            "output directory {} is not usable: {err}",
            parent.display()
        ))
    })?;
    if !meta.is_dir() {
        return Err(ConfigError::Validation(format!(
            "output directory {} is not a directory",
            parent.display()
        )));
    }
    if meta.permissions().readonly() {
        return Err(ConfigError::Validation(format!(
            "output directory {} is read-only",
            parent.display()
        )));
    }
    if let Ok(existing) = fs::metadata(path) {
        if existing.is_dir() || existing.permissions().readonly() {
            return Err(ConfigError::Validation(format!(
                "output path {} is not writable",
                path.display()
            )));
        }
    }
    Ok(())
}

mod duration_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

mod optional_duration_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let text = Option::<String>::deserialize(d)?;
        text.map(|t| humantime::parse_duration(&t).map_err(serde::de::Error::custom))
            .transpose()
    }
}

fn default_hosts() -> Vec<String> {
    vec!["localhost".to_string()]
}

const fn default_hours() -> u64 {
    24
}

fn default_logs() -> Vec<String> {
    vec!["System".to_string(), "Application".to_string()]
}

fn default_levels() -> Vec<LogLevel> {
    vec![LogLevel::Critical, LogLevel::Error, LogLevel::Warning]
}

const fn default_max_records() -> usize {
    1000
}

const fn default_message_cap() -> usize {
    500
}

const fn default_health() -> bool {
    true
}

fn default_output() -> PathBuf {
    PathBuf::from("fleet-report.csv")
}

const fn default_top() -> usize {
    10
}

const fn default_parallelism() -> usize {
    1
}

const fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_retry_attempts() -> u32 {
    1
}

const fn default_retry_backoff() -> Duration {
    Duration::from_secs(2)
}

const fn default_probe_port() -> u16 {
    5985
}

const fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

const fn default_agent_port() -> u16 {
    9182
}

fn default_agent_scheme() -> String {
    "http".to_string()
}
