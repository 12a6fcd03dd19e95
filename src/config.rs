//! Runtime configuration: one serde struct per component, loaded from YAML or JSON.
//!
//! Durations are plain millisecond fields (`*_ms`). Loading never consults the
//! environment; callers decide where a file comes from.

use crate::error::ErrorContext;
use crate::execution::ExecutionConfig;
use crate::pool::PoolConfig;
use crate::recovery::{CheckpointPolicy, ConsistencyConfig, RecoveryConfig};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::sizing::SizingConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything a [`crate::BatchOrchestrator`] needs to be built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub sizing: SizingConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub execution: ExecutionConfig,
    pub checkpoint: CheckpointPolicy,
    pub recovery: RecoveryConfig,
    pub consistency: ConsistencyConfig,
    /// Failed batches kept for reprocessing; the oldest is evicted beyond this.
    pub dead_letter_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sizing: SizingConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            execution: ExecutionConfig::default(),
            checkpoint: CheckpointPolicy::default(),
            recovery: RecoveryConfig::default(),
            consistency: ConsistencyConfig::default(),
            dead_letter_capacity: 1_000,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sizing(mut self, sizing: SizingConfig) -> Self {
        self.sizing = sizing;
        self
    }
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
    pub fn with_execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }
    pub fn with_checkpoint(mut self, checkpoint: CheckpointPolicy) -> Self {
        self.checkpoint = checkpoint;
        self
    }
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
    pub fn with_consistency(mut self, consistency: ConsistencyConfig) -> Self {
        self.consistency = consistency;
        self
    }
    pub fn with_dead_letter_capacity(mut self, n: usize) -> Self {
        self.dead_letter_capacity = n;
        self
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Read a config file; `.json` is parsed as JSON, anything else as YAML.
    ///
    /// The result is not validated; call [`RuntimeConfig::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        let is_json = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("json"))
            == Some(true);
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    /// Reject settings no component can run with. Reports the first problem found.
    pub fn validate(&self) -> Result<()> {
        let s = &self.sizing;
        check(s.min_batch_size > 0, "sizing.min_batch_size", "must be at least 1")?;
        check(
            s.min_batch_size <= s.max_batch_size,
            "sizing.min_batch_size",
            format!("{} exceeds max_batch_size {}", s.min_batch_size, s.max_batch_size),
        )?;
        check(s.history_window > 0, "sizing.history_window", "must be at least 1")?;

        let p = &self.pool;
        check(p.max_connections > 0, "pool.max_connections", "must be at least 1")?;
        check(
            p.min_connections <= p.max_connections,
            "pool.min_connections",
            format!("{} exceeds max_connections {}", p.min_connections, p.max_connections),
        )?;
        check(p.acquire_timeout_ms > 0, "pool.acquire_timeout_ms", "must be positive")?;

        let r = &self.retry;
        check(
            (0.0..=1.0).contains(&r.jitter_pct),
            "retry.jitter_pct",
            format!("{} is outside [0, 1]", r.jitter_pct),
        )?;
        check(
            r.base_delay_ms <= r.max_delay_ms,
            "retry.base_delay_ms",
            format!("{} exceeds max_delay_ms {}", r.base_delay_ms, r.max_delay_ms),
        )?;
        check(
            (0.0..=1.0).contains(&self.recovery.retry.jitter_pct),
            "recovery.retry.jitter_pct",
            format!("{} is outside [0, 1]", self.recovery.retry.jitter_pct),
        )?;

        let b = &self.breaker;
        check(b.failure_threshold > 0, "breaker.failure_threshold", "must be at least 1")?;
        check(b.half_open_max_calls > 0, "breaker.half_open_max_calls", "must be at least 1")?;

        check(self.execution.concurrency > 0, "execution.concurrency", "must be at least 1")?;
        check(
            self.execution.batch_timeout_ms != Some(0),
            "execution.batch_timeout_ms",
            "must be positive when set",
        )?;
        check(
            !self.checkpoint.enabled || self.checkpoint.every_n_batches > 0,
            "checkpoint.every_n_batches",
            "must be at least 1 when checkpoints are enabled",
        )?;
        check(self.dead_letter_capacity > 0, "dead_letter_capacity", "must be at least 1")?;
        Ok(())
    }
}

fn check(ok: bool, field: &str, details: impl Into<String>) -> Result<()> {
    if ok {
        return Ok(());
    }
    Err(Error::configuration_with_context(
        "invalid runtime configuration",
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("config_validator"),
    ))
}
