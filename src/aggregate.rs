use crate::classify::Classifier;
use crate::collectors::probe::{probe_host, ProbeOutcome};
use crate::collectors::{HostQuery, QueryError, QueryErrorKind, QuerySpec};
use crate::normalize::Normalizer;
use crate::records::{HostTarget, LogLevel, NormalizedRecord, Observation, RawRecord, Status};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per query; 1 disables retries.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSettings {
    pub port: u16,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub parallelism: usize,
    pub query_timeout: Duration,
    pub retry: RetryPolicy,
    pub deadline: Option<Duration>,
    pub dedup: bool,
    pub probe: Option<ProbeSettings>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            query_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            deadline: None,
            dedup: false,
            probe: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFailure {
    pub query: String,
    pub kind: QueryErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCounters {
    pub total: u64,
    pub critical_count: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub ok_count: u64,
    pub logs_processed: u64,
    pub logs_skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Critical,
    Error,
    Warning,
    Ok,
}

/// Every stored row lands in exactly one bucket: events by level, health
/// rows by status.
fn bucket_of(observation: &Observation) -> Bucket {
    match &observation.record {
        NormalizedRecord::LogEvent(e) => match e.level {
            LogLevel::Critical => Bucket::Critical,
            LogLevel::Error => Bucket::Error,
            LogLevel::Warning => Bucket::Warning,
            LogLevel::Information | LogLevel::Verbose => Bucket::Ok,
        },
        NormalizedRecord::Health(_) => match observation.verdict.status {
            Status::Error | Status::Attention => Bucket::Error,
            Status::Warning => Bucket::Warning,
            Status::Ok => Bucket::Ok,
        },
    }
}

impl HostCounters {
    fn count(&mut self, observation: &Observation) {
        self.total += 1;
        match bucket_of(observation) {
            Bucket::Critical => self.critical_count += 1,
            Bucket::Error => self.error_count += 1,
            Bucket::Warning => self.warning_count += 1,
            Bucket::Ok => self.ok_count += 1,
        }
    }

    pub fn recompute(
        observations: &[Observation],
        logs_processed: u64,
        logs_skipped: u64,
    ) -> Self {
        let mut counters = Self {
            logs_processed,
            logs_skipped,
            ..Self::default()
        };
        for observation in observations {
            counters.count(observation);
        }
        counters
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostResult {
    pub host: HostTarget,
    pub observations: Vec<Observation>,
    pub query_errors: Vec<QueryFailure>,
    pub counters: HostCounters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetRunResult {
    /// In the order the hosts were given.
    pub hosts: Vec<HostResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub cancelled: bool,
    pub deduplicated: bool,
}

impl FleetRunResult {
    pub fn host(&self, host: &HostTarget) -> Option<&HostResult> {
        self.hosts.iter().find(|h| &h.host == host)
    }

    pub fn total_records(&self) -> usize {
        self.hosts.iter().map(|h| h.observations.len()).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&HostTarget, &QueryFailure)> {
        self.hosts
            .iter()
            .flat_map(|h| h.query_errors.iter().map(move |f| (&h.host, f)))
    }

    /// Collapses duplicates after the fact and rebuilds the counters.
    pub fn deduplicate(mut self) -> Self {
        for host in &mut self.hosts {
            host.observations = dedup(std::mem::take(&mut host.observations));
            host.counters = HostCounters::recompute(
                &host.observations,
                host.counters.logs_processed,
                host.counters.logs_skipped,
            );
        }
        self.deduplicated = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Event {
        event_id: u32,
        source: String,
        host: HostTarget,
    },
    Health {
        host: HostTarget,
        drive_id: String,
    },
}

fn dedup_key(record: &NormalizedRecord) -> DedupKey {
    match record {
        NormalizedRecord::LogEvent(e) => DedupKey::Event {
            event_id: e.event_id,
            source: e.source.clone(),
            host: e.host.clone(),
        },
        NormalizedRecord::Health(h) => DedupKey::Health {
            host: h.host.clone(),
            drive_id: h.drive_id.clone(),
        },
    }
}

/// Keeps the first observation per key in iteration order and folds the
/// rest into its `occurrences`.
pub fn dedup(observations: Vec<Observation>) -> Vec<Observation> {
    let mut index: HashMap<DedupKey, usize> = HashMap::new();
    let mut out: Vec<Observation> = Vec::with_capacity(observations.len());
    for observation in observations {
        let key = dedup_key(&observation.record);
        match index.get(&key) {
            Some(&i) => out[i].occurrences += observation.occurrences,
            None => {
                index.insert(key, out.len());
                out.push(observation);
            }
        }
    }
    out
}

/// Per-host collection owned by the aggregator while merging. Counters move
/// with every stored row so they always match a recomputation.
struct HostAccumulator {
    host: HostTarget,
    dedup: bool,
    index: HashMap<DedupKey, usize>,
    observations: Vec<Observation>,
    query_errors: Vec<QueryFailure>,
    counters: HostCounters,
}

impl HostAccumulator {
    fn new(host: HostTarget, dedup: bool) -> Self {
        Self {
            host,
            dedup,
            index: HashMap::new(),
            observations: Vec::new(),
            query_errors: Vec::new(),
            counters: HostCounters::default(),
        }
    }

    fn push(&mut self, observation: Observation) {
        if self.dedup {
            let key = dedup_key(&observation.record);
            if let Some(&i) = self.index.get(&key) {
                self.observations[i].occurrences += observation.occurrences;
                return;
            }
            self.index.insert(key, self.observations.len());
        }
        self.counters.count(&observation);
        self.observations.push(observation);
    }

    fn query_succeeded(&mut self) {
        self.counters.logs_processed += 1;
    }

    fn query_failed(&mut self, query: &str, err: QueryError) {
        warn!(host = %self.host, query = %query, kind = %err.kind, error = %err.message, "query failed");
        self.counters.logs_skipped += 1;
        self.query_errors.push(QueryFailure {
            query: query.to_string(),
            kind: err.kind,
            message: err.message,
        });
    }

    fn finish(self) -> HostResult {
        HostResult {
            host: self.host,
            observations: self.observations,
            query_errors: self.query_errors,
            counters: self.counters,
        }
    }
}

type SlotOutcome = Result<Vec<RawRecord>, QueryError>;

pub struct Aggregator {
    adapter: Arc<dyn HostQuery>,
    normalizer: Normalizer,
    classifier: Box<dyn Classifier>,
    options: RunOptions,
}

impl Aggregator {
    pub fn new(
        adapter: Arc<dyn HostQuery>,
        normalizer: Normalizer,
        classifier: Box<dyn Classifier>,
        options: RunOptions,
    ) -> Self {
        Self {
            adapter,
            normalizer,
            classifier,
            options,
        }
    }

    /// Queries every (host, query) pair, then merges the outcomes in host
    /// order, query order, adapter order. Query failures become data; a
    /// cancellation keeps everything already collected.
    pub async fn run(
        &self,
        hosts: &[HostTarget],
        specs: &[QuerySpec],
        mut cancel: watch::Receiver<bool>,
    ) -> FleetRunResult {
        let started_at = Utc::now();
        let slot_count = hosts.len() * specs.len();
        info!(
            hosts = hosts.len(),
            queries = slot_count,
            parallelism = self.options.parallelism,
            "fleet run started"
        );

        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let probes: Arc<Vec<OnceCell<ProbeOutcome>>> =
            Arc::new(hosts.iter().map(|_| OnceCell::new()).collect());
        let mut tasks: JoinSet<(usize, SlotOutcome)> = JoinSet::new();

        for (host_idx, host) in hosts.iter().enumerate() {
            for (spec_idx, spec) in specs.iter().enumerate() {
                let slot = host_idx * specs.len() + spec_idx;
                let job = QueryJob {
                    adapter: self.adapter.clone(),
                    host: host.clone(),
                    spec: spec.clone(),
                    timeout: self.options.query_timeout,
                    retry: self.options.retry,
                    probe: self.options.probe,
                };
                let semaphore = semaphore.clone();
                let probes = probes.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (slot, Err(QueryError::new(QueryErrorKind::Cancelled, "worker pool closed")));
                    };
                    (slot, job.execute(&probes[host_idx]).await)
                });
            }
        }

        let mut slots: Vec<Option<SlotOutcome>> = (0..slot_count).map(|_| None).collect();
        let mut cancelled = *cancel.borrow();
        let mut cancel_open = true;
        let deadline = self.options.deadline;
        let deadline_timer = async move {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_timer);

        while !cancelled {
            tokio::select! {
                biased;
                joined = tasks.join_next() => match joined {
                    Some(Ok((slot, outcome))) => slots[slot] = Some(outcome),
                    Some(Err(err)) => warn!(error = %err, "query task ended abnormally"),
                    None => break,
                },
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) => cancelled = *cancel.borrow(),
                    Err(_) => cancel_open = false,
                },
                _ = &mut deadline_timer => {
                    warn!("run deadline reached, abandoning in-flight queries");
                    cancelled = true;
                }
            }
        }
        if cancelled {
            semaphore.close();
            tasks.abort_all();
            collect_finished(&mut tasks, &mut slots);
            info!(
                finished = slots.iter().filter(|s| s.is_some()).count(),
                total = slot_count,
                "fleet run cancelled, keeping collected results"
            );
        }

        let mut results = Vec::with_capacity(hosts.len());
        for (host_idx, host) in hosts.iter().enumerate() {
            let mut acc = HostAccumulator::new(host.clone(), self.options.dedup);
            for (spec_idx, spec) in specs.iter().enumerate() {
                let slot = host_idx * specs.len() + spec_idx;
                match slots[slot].take() {
                    Some(Ok(raws)) => {
                        acc.query_succeeded();
                        for raw in raws {
                            let record = self.normalizer.normalize(host, raw, Utc::now());
                            let verdict = self.classifier.classify(&record);
                            acc.push(Observation::new(record, verdict));
                        }
                    }
                    Some(Err(err)) => acc.query_failed(spec.label(), err),
                    None if cancelled => acc.query_failed(
                        spec.label(),
                        QueryError::new(QueryErrorKind::Cancelled, "abandoned by cancellation"),
                    ),
                    None => acc.query_failed(
                        spec.label(),
                        QueryError::unreachable("query task ended before returning"),
                    ),
                }
            }
            let result = acc.finish();
            debug!(
                host = %result.host,
                records = result.counters.total,
                skipped = result.counters.logs_skipped,
                "host merged"
            );
            results.push(result);
        }

        let completed_at = Utc::now();
        info!(
            records = results.iter().map(|h| h.observations.len()).sum::<usize>(),
            failures = results.iter().map(|h| h.query_errors.len()).sum::<usize>(),
            cancelled,
            "fleet run finished"
        );
        FleetRunResult {
            hosts: results,
            started_at,
            completed_at,
            cancelled,
            deduplicated: self.options.dedup,
        }
    }
}

/// Moves every already-completed task result into its slot without waiting
/// on the rest.
fn collect_finished(
    tasks: &mut JoinSet<(usize, SlotOutcome)>,
    slots: &mut [Option<SlotOutcome>],
) {
    while let Some(joined) = tasks.try_join_next() {
        match joined {
            Ok((slot, outcome)) => slots[slot] = Some(outcome),
            Err(err) if err.is_cancelled() => {}
            Err(err) => warn!(error = %err, "query task ended abnormally"),
        }
    }
}

struct QueryJob {
    adapter: Arc<dyn HostQuery>,
    host: HostTarget,
    spec: QuerySpec,
    timeout: Duration,
    retry: RetryPolicy,
    probe: Option<ProbeSettings>,
}

impl QueryJob {
    async fn execute(&self, probe_cell: &OnceCell<ProbeOutcome>) -> SlotOutcome {
        if let Some(settings) = self.probe {
            let outcome = probe_cell
                .get_or_init(|| probe_host(&self.host, settings.port, settings.timeout))
                .await;
            if !outcome.reachable {
                return Err(QueryError::unreachable(
                    outcome
                        .detail
                        .clone()
                        .unwrap_or_else(|| "host did not answer the probe".to_string()),
                ));
            }
        }

        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(
                self.timeout,
                self.adapter.query(&self.host, &self.spec),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(QueryError::new(
                    QueryErrorKind::Timeout,
                    format!(
                        "no answer within {}",
                        humantime::format_duration(self.timeout)
                    ),
                )),
            };
            match outcome {
                Err(err) if err.kind.is_retryable() && attempt < attempts => {
                    debug!(
                        host = %self.host,
                        query = %self.spec.label(),
                        attempt,
                        error = %err,
                        "retrying query"
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
