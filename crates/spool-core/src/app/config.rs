//! ServiceConfig - サービス単位の設定
//!
//! 既定値は従来の運用値（qps=256, max_batch_size=128, single, worker=1）。
//! `from_env` で `<PREFIX>_*` 環境変数から上書きできる。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::queue::AdmissionPolicy;

pub const DEFAULT_QPS: u32 = 256;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 128;
pub const DEFAULT_MAX_BATCH_WAIT: Duration = Duration::from_millis(100);
pub const DEFAULT_CONSUME_WORKER: usize = 1;

/// Queue capacity is this many seconds' worth of `qps`.
const CAPACITY_PER_QPS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("not support consume_type {0}")]
    InvalidConsumeType(String),

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("service name must not be empty")]
    EmptyName,

    #[error("qps {qps} gives a queue larger than {max} slots")]
    QueueTooLarge { qps: u32, max: usize },
}

/// Dispatch strategy a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumeType {
    #[default]
    Single,
    Batch,
}

impl fmt::Display for ConsumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumeType::Single => f.write_str("single"),
            ConsumeType::Batch => f.write_str("batch"),
        }
    }
}

impl FromStr for ConsumeType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(ConsumeType::Single),
            "batch" => Ok(ConsumeType::Batch),
            _ => Err(ConfigError::InvalidConsumeType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    /// Route the hosting process binds this service to. Informational only.
    pub interface: String,
    pub qps: u32,
    pub max_batch_size: usize,
    /// Batch mode flushes a non-empty batch once it is this old.
    pub max_batch_wait: Duration,
    pub consume_worker: usize,
    pub consume_type: ConsumeType,
    pub admission: AdmissionPolicy,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            interface: format!("/{name}"),
            name,
            qps: DEFAULT_QPS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_wait: DEFAULT_MAX_BATCH_WAIT,
            consume_worker: DEFAULT_CONSUME_WORKER,
            consume_type: ConsumeType::default(),
            admission: AdmissionPolicy::default(),
        }
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn qps(mut self, qps: u32) -> Self {
        self.qps = qps;
        self
    }

    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.max_batch_size = n;
        self
    }

    pub fn max_batch_wait(mut self, wait: Duration) -> Self {
        self.max_batch_wait = wait;
        self
    }

    pub fn consume_worker(mut self, n: usize) -> Self {
        self.consume_worker = n;
        self
    }

    pub fn consume_type(mut self, consume_type: ConsumeType) -> Self {
        self.consume_type = consume_type;
        self
    }

    pub fn admission(mut self, admission: AdmissionPolicy) -> Self {
        self.admission = admission;
        self
    }

    /// Pop timeout for workers: `1 / qps` seconds.
    pub fn latency(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.qps.max(1)))
    }

    /// `10 × qps`.
    pub fn queue_capacity(&self) -> usize {
        (self.qps as usize).saturating_mul(CAPACITY_PER_QPS)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.qps == 0 {
            return Err(ConfigError::Zero { field: "qps" });
        }
        if self.queue_capacity() > Semaphore::MAX_PERMITS {
            return Err(ConfigError::QueueTooLarge {
                qps: self.qps,
                max: Semaphore::MAX_PERMITS,
            });
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_batch_size",
            });
        }
        if self.consume_worker == 0 {
            return Err(ConfigError::Zero {
                field: "consume_worker",
            });
        }
        Ok(())
    }

    /// Defaults for `name`, overridden from the environment (see `with_lookup`).
    pub fn from_env(name: impl Into<String>, prefix: &str) -> Result<Self, ConfigError> {
        Self::new(name).with_env(prefix)
    }

    /// Apply `<PREFIX>_*` environment overrides on top of `self`.
    pub fn with_env(self, prefix: &str) -> Result<Self, ConfigError> {
        self.with_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Override fields from `<PREFIX>_QPS`, `<PREFIX>_MAX_BATCH_SIZE`,
    /// `<PREFIX>_MAX_BATCH_WAIT_MS`, `<PREFIX>_CONSUME_WORKER`,
    /// `<PREFIX>_CONSUME_TYPE`, `<PREFIX>_ADMISSION` and `<PREFIX>_INTERFACE`
    /// as returned by `lookup`, then validate.
    pub fn with_lookup<F>(mut self, prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let key = format!("{prefix}_{suffix}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, v)) = var("INTERFACE") {
            self.interface = v;
        }
        if let Some((key, v)) = var("QPS") {
            self.qps = parse(&key, &v)?;
        }
        if let Some((key, v)) = var("MAX_BATCH_SIZE") {
            self.max_batch_size = parse(&key, &v)?;
        }
        if let Some((key, v)) = var("MAX_BATCH_WAIT_MS") {
            self.max_batch_wait = Duration::from_millis(parse(&key, &v)?);
        }
        if let Some((key, v)) = var("CONSUME_WORKER") {
            self.consume_worker = parse(&key, &v)?;
        }
        if let Some((_, v)) = var("CONSUME_TYPE") {
            self.consume_type = v.parse()?;
        }
        if let Some((key, v)) = var("ADMISSION") {
            self.admission = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key, value: v })?;
        }

        self.validate()?;
        Ok(self)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
