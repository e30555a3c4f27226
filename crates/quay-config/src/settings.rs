//! Settings structures.

use quay_core::{QueueError, QueueResult, TelemetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root settings for a Quay worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuaySettings {
    /// Backend adapter selection and connection settings.
    #[serde(default)]
    pub adapter: AdapterSettings,

    /// Worker loop settings.
    #[serde(default)]
    pub worker: WorkerSettings,

    /// System default job policy.
    #[serde(default)]
    pub jobs: JobDefaults,

    /// Tracing setup.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl QuaySettings {
    /// Validates values that serde defaults cannot guard.
    pub fn validate(&self) -> QueueResult<()> {
        if self.worker.queue.trim().is_empty() {
            return Err(QueueError::Configuration(
                "worker.queue must not be empty".to_string(),
            ));
        }

        match self.adapter.kind {
            AdapterKind::Redis => {
                if self.adapter.redis.url.is_empty() {
                    return Err(QueueError::Configuration(
                        "adapter.redis.url is required".to_string(),
                    ));
                }
                if self.adapter.redis.pool_size == 0 {
                    return Err(QueueError::Configuration(
                        "adapter.redis.pool_size must be at least 1".to_string(),
                    ));
                }
            }
            AdapterKind::Iron => {
                let iron = &self.adapter.iron;
                if iron.project_id.is_empty() || iron.token.is_empty() {
                    return Err(QueueError::Configuration(
                        "adapter.iron.project_id and adapter.iron.token are required".to_string(),
                    ));
                }
                if iron.dead_letter_queue.as_deref() == Some(self.worker.queue.as_str()) {
                    return Err(QueueError::Configuration(
                        "adapter.iron.dead_letter_queue must differ from worker.queue".to_string(),
                    ));
                }
            }
            AdapterKind::Direct => {}
        }

        Ok(())
    }
}

/// Which backend the worker talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Leased queue on Redis.
    #[default]
    Redis,
    /// IronMQ v3 over HTTP.
    Iron,
    /// In-process queue.
    Direct,
}

/// Adapter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterSettings {
    /// Selected backend.
    #[serde(default)]
    pub kind: AdapterKind,

    /// Push defaults shared by every backend.
    #[serde(default)]
    pub defaults: AdapterDefaults,

    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisSettings,

    /// IronMQ connection settings.
    #[serde(default)]
    pub iron: IronSettings,
}

/// Defaults applied to pushes that do not set their own options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterDefaults {
    /// Priority, lower is more urgent.
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Lease (time-to-run) in seconds.
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,

    /// Delay before a pushed message becomes ready, in seconds.
    #[serde(default)]
    pub delay_secs: u64,
}

impl Default for AdapterDefaults {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            lease_timeout_secs: default_lease_timeout(),
            delay_secs: 0,
        }
    }
}

impl AdapterDefaults {
    /// Returns the lease timeout as Duration.
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    /// Returns the push delay as Duration.
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

fn default_priority() -> u32 {
    1024
}

fn default_lease_timeout() -> u64 {
    60
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for every queue key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often a blocking pop re-polls, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl RedisSettings {
    /// Returns the poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_key_prefix() -> String {
    "quay".to_string()
}

fn default_poll_interval() -> u64 {
    100
}

/// IronMQ connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IronSettings {
    /// URL scheme.
    #[serde(default = "default_iron_scheme")]
    pub scheme: String,

    /// API host.
    #[serde(default = "default_iron_host")]
    pub host: String,

    /// API port.
    #[serde(default = "default_iron_port")]
    pub port: u16,

    /// Project identifier.
    #[serde(default)]
    pub project_id: String,

    /// OAuth token.
    #[serde(default)]
    pub token: String,

    /// Queue that buried messages are republished to. Without one the
    /// adapter has no bury capability.
    #[serde(default)]
    pub dead_letter_queue: Option<String>,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_iron_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for IronSettings {
    fn default() -> Self {
        Self {
            scheme: default_iron_scheme(),
            host: default_iron_host(),
            port: default_iron_port(),
            project_id: String::new(),
            token: String::new(),
            dead_letter_queue: None,
            request_timeout_secs: default_iron_request_timeout(),
        }
    }
}

impl IronSettings {
    /// Base URL of the API, without the version path.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Returns the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_iron_scheme() -> String {
    "https".to_string()
}

fn default_iron_host() -> String {
    "mq-aws-us-east-1-1.iron.io".to_string()
}

fn default_iron_port() -> u16 {
    443
}

fn default_iron_request_timeout() -> u64 {
    // IronMQ long-polls reservations for up to 30 seconds.
    40
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Queue the worker pops from.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// How long a single pop may wait for a message, in seconds.
    #[serde(default)]
    pub pop_timeout_secs: u64,

    /// Sleep between empty pops, in milliseconds.
    #[serde(default = "default_sleep")]
    pub sleep_ms: u64,

    /// Resident memory ceiling in megabytes; the listen loop exits above it.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,

    /// Stop listening after this many jobs.
    #[serde(default)]
    pub max_jobs: Option<u64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            pop_timeout_secs: 0,
            sleep_ms: default_sleep(),
            memory_limit_mb: default_memory_limit(),
            max_jobs: None,
        }
    }
}

impl WorkerSettings {
    /// Returns the pop timeout as Duration.
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }

    /// Returns the idle sleep as Duration.
    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_sleep() -> u64 {
    1000
}

fn default_memory_limit() -> u64 {
    128
}

/// System defaults for the per-job policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefaults {
    /// Retries allowed after the first attempt.
    #[serde(default)]
    pub retry: u32,

    /// Release delay in seconds.
    #[serde(default)]
    pub delay: u64,

    /// Bury when retries are exhausted.
    #[serde(default)]
    pub bury: bool,

    /// Delete after successful execution.
    #[serde(default)]
    pub delete: bool,
}
