//! Environment-backed configuration: a plain struct populated by a single
//! `from_env()` call, not a derive-macro settings crate.

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Dedup/admission window sizing.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub dedupe_window_ms: i64,
    pub clock_skew_ms: i64,
}

impl AdmissionConfig {
    pub fn from_env() -> Self {
        Self {
            dedupe_window_ms: env_or("TASK_DEDUPE_WINDOW_MS", 60_000),
            clock_skew_ms: env_or("TASK_CLOCK_SKEW_MS", 500),
        }
    }
}

/// Retry/DLQ backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    /// Wall-clock budget for one handler invocation. `0` disables the
    /// timeout; a handler that exceeds it is reported as a normal
    /// execution failure, subject to the same retry policy as any other.
    pub handler_timeout_ms: u64,
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_or("TASK_MAX_ATTEMPTS", 5),
            backoff_base_ms: env_or("TASK_RETRY_BACKOFF_MS", 500),
            backoff_multiplier: env_or("TASK_RETRY_BACKOFF_MULTIPLIER", 2.0),
            handler_timeout_ms: env_or("TASK_HANDLER_TIMEOUT_MS", 30_000),
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        if self.handler_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.handler_timeout_ms))
        }
    }
}

/// Broker connection and stream naming.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub redis_url: String,
    pub stream: String,
    pub dlq_stream: String,
    pub group: String,
    pub consumer: String,
    pub block_ms: u64,
    pub max_len: u64,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            stream: env::var("REDIS_STREAM").unwrap_or_else(|_| "trx.tasks".to_string()),
            dlq_stream: env::var("REDIS_DLQ_STREAM").unwrap_or_else(|_| "trx.tasks.dlq".to_string()),
            group: env::var("REDIS_GROUP").unwrap_or_else(|_| "trx.workers".to_string()),
            consumer: env::var("WORKER_NAME").unwrap_or_else(|_| "worker-1".to_string()),
            block_ms: env_or("WORKER_BLOCK_MS", 5_000),
            max_len: env_or("REDIS_STREAM_MAXLEN", 10_000),
        }
    }
}

/// Top-level configuration assembled by each binary at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub admission: AdmissionConfig,
    pub retry: RetryConfig,
    pub broker: BrokerConfig,
}

impl Config {
    /// Load from the process environment, calling `dotenvy::dotenv()` first
    /// so a local `.env` file (if present) is folded in before reading.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/taskrunner".to_string()),
            admission: AdmissionConfig::from_env(),
            retry: RetryConfig::from_env(),
            broker: BrokerConfig::from_env(),
        }
    }
}
