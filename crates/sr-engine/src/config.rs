//! Executor configuration: concurrency limits, worker pool sizing and retry
//! timing, with environment overrides.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use sr_types::{config_error, SrResult};

pub const ENV_MAX_CONCURRENT_TASKS: &str = "SR_MAX_CONCURRENT_TASKS";
pub const ENV_WORKER_THREADS: &str = "SR_WORKER_THREADS";
pub const ENV_WORKER_QUEUE_CAPACITY: &str = "SR_WORKER_QUEUE_CAPACITY";
pub const ENV_TASK_RETRY_DELAY_MS: &str = "SR_TASK_RETRY_DELAY_MS";

/// Lower bound on concurrently admitted tasks.
pub const MIN_CONCURRENT_TASKS: usize = 2;
/// Upper bound on concurrently admitted tasks.
pub const DEFAULT_CONCURRENCY_CEILING: usize = 24;
pub const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
const MAX_WORKER_THREADS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Cluster-facing in-flight task bound for this node.
    pub max_concurrent_tasks: usize,
    pub worker_threads: usize,
    /// Work items the pool may hold before it rejects new ones.
    pub worker_queue_capacity: usize,
    /// Fixed delay before a deferred task retries admission.
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Cutoff for metrics; `None` uses each batch's result size.
    pub primary_metric_cutoff: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let processors = available_processors();
        Self {
            max_concurrent_tasks: default_max_concurrent(processors),
            worker_threads: default_worker_threads(processors),
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
            retry_delay: DEFAULT_RETRY_DELAY,
            primary_metric_cutoff: None,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by any `SR_*` variables present in the environment.
    pub fn from_env() -> SrResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SrResult<Self> {
        let mut config = Self::default();
        if let Some(value) = parse_var::<usize>(&lookup, ENV_MAX_CONCURRENT_TASKS)? {
            config.max_concurrent_tasks = value;
        }
        if let Some(value) = parse_var::<usize>(&lookup, ENV_WORKER_THREADS)? {
            config.worker_threads = value;
        }
        if let Some(value) = parse_var::<usize>(&lookup, ENV_WORKER_QUEUE_CAPACITY)? {
            config.worker_queue_capacity = value;
        }
        if let Some(value) = parse_var::<u64>(&lookup, ENV_TASK_RETRY_DELAY_MS)? {
            config.retry_delay = Duration::from_millis(value);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_primary_metric_cutoff(mut self, cutoff: usize) -> Self {
        self.primary_metric_cutoff = Some(cutoff);
        self
    }

    pub fn validate(&self) -> SrResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(config_error!("max_concurrent_tasks must be greater than zero"));
        }
        if self.worker_threads == 0 {
            return Err(config_error!("worker_threads must be greater than zero"));
        }
        if self.worker_queue_capacity == 0 {
            return Err(config_error!("worker_queue_capacity must be greater than zero"));
        }
        if self.retry_delay.is_zero() {
            return Err(config_error!("retry_delay must be greater than zero"));
        }
        if self.primary_metric_cutoff == Some(0) {
            return Err(config_error!("primary_metric_cutoff must be greater than zero"));
        }
        Ok(())
    }
}

/// Half the processors, kept within `[2, 24]`.
pub fn default_max_concurrent(processors: usize) -> usize {
    (processors / 2)
        .min(DEFAULT_CONCURRENCY_CEILING)
        .clamp(MIN_CONCURRENT_TASKS, DEFAULT_CONCURRENCY_CEILING)
}

pub fn default_worker_threads(processors: usize) -> usize {
    let scaled = (processors / 4).max(2).saturating_mul(4).min(MAX_WORKER_THREADS);
    (processors / 2).max(scaled)
}

fn available_processors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> SrResult<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| config_error!("{key} has invalid value '{raw}'")),
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
