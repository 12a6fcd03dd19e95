//! 自适应批大小模块：根据吞吐历史与当前负载计算下一批次大小。
//!
//! # Adaptive Batch Sizing
//!
//! [`BatchSizer`] keeps a bounded window of [`ThroughputSample`]s and asks a
//! [`SizingPolicy`] for the next batch size. The result is always clamped to the
//! configured bounds.
//!
//! - With at least `min_samples` samples the [`RegressionPolicy`] fits throughput
//!   against batch size, scans candidate sizes, and blends the best candidate with
//!   a trend adjustment and a load-dampening factor.
//! - With fewer samples the [`HeuristicPolicy`] nudges the current size from the
//!   last error rate and the load signal.
//! - A window whose batch sizes do not vary keeps the current size.
//! - After `max_optimizer_failures` consecutive policy failures the sizer falls back
//!   to a conservative fixed size until a policy succeeds again.

mod policy;

pub use policy::{HeuristicPolicy, RegressionPolicy, SizingError, SizingPolicy};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    /// Size used after repeated optimizer failures. `None` means `2 * min_batch_size`.
    pub fallback_batch_size: Option<usize>,
    pub history_window: usize,
    pub min_samples: usize,
    pub max_optimizer_failures: u32,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 500,
            initial_batch_size: 50,
            fallback_batch_size: None,
            history_window: 50,
            min_samples: 10,
            max_optimizer_failures: 3,
        }
    }
}

impl SizingConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_batch_size = min;
        self.max_batch_size = max;
        self
    }
    pub fn with_initial(mut self, size: usize) -> Self {
        self.initial_batch_size = size;
        self
    }
    pub fn with_fallback(mut self, size: usize) -> Self {
        self.fallback_batch_size = Some(size);
        self
    }
    pub fn with_history_window(mut self, n: usize) -> Self {
        self.history_window = n;
        self
    }

    pub fn clamp(&self, size: usize) -> usize {
        size.clamp(self.min_batch_size, self.max_batch_size.max(self.min_batch_size))
    }

    pub fn conservative_size(&self) -> usize {
        self.clamp(
            self.fallback_batch_size
                .unwrap_or(self.min_batch_size.saturating_mul(2)),
        )
    }
}

/// One observation of a processed batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub batch_size: usize,
    pub elapsed_ms: u64,
    pub item_count: usize,
    /// Failed items over items, `0.0..=1.0`.
    pub error_rate: f64,
}

impl ThroughputSample {
    pub fn new(batch_size: usize, elapsed: Duration, item_count: usize, error_rate: f64) -> Self {
        Self {
            batch_size,
            elapsed_ms: elapsed.as_millis() as u64,
            item_count,
            error_rate: error_rate.clamp(0.0, 1.0),
        }
    }

    /// Items per second.
    pub fn throughput(&self) -> f64 {
        let secs = (self.elapsed_ms.max(1)) as f64 / 1000.0;
        self.item_count as f64 / secs
    }
}

/// Current system pressure, each component in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSignal {
    pub cpu: f64,
    pub memory: f64,
    pub queue: f64,
}

impl LoadSignal {
    pub fn new(cpu: f64, memory: f64, queue: f64) -> Self {
        Self {
            cpu: cpu.clamp(0.0, 1.0),
            memory: memory.clamp(0.0, 1.0),
            queue: queue.clamp(0.0, 1.0),
        }
    }

    pub fn pressure(&self) -> f64 {
        self.cpu.max(self.memory).max(self.queue)
    }

    /// Multiplier applied to a proposed size: shrink under pressure, grow when idle.
    pub fn dampening(&self) -> f64 {
        let p = self.pressure();
        if p > 0.8 {
            0.7
        } else if p > 0.6 {
            0.85
        } else if p < 0.3 {
            1.15
        } else {
            1.0
        }
    }
}

/// Source of load readings (host metrics, queue depth, ...).
pub trait LoadProbe: Send + Sync {
    fn sample(&self) -> LoadSignal;
}

/// Probe that always reports the same reading.
pub struct StaticLoadProbe(pub LoadSignal);

impl LoadProbe for StaticLoadProbe {
    fn sample(&self) -> LoadSignal {
        self.0
    }
}

#[derive(Debug)]
struct SizerState {
    history: VecDeque<ThroughputSample>,
    current: usize,
    optimizer_failures: u32,
}

/// Adaptive batch sizer.
pub struct BatchSizer {
    config: SizingConfig,
    policy: Arc<dyn SizingPolicy>,
    fallback: HeuristicPolicy,
    state: Mutex<SizerState>,
}

impl BatchSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self::with_policy(config, Arc::new(RegressionPolicy::default()))
    }

    pub fn with_policy(config: SizingConfig, policy: Arc<dyn SizingPolicy>) -> Self {
        let current = config.clamp(config.initial_batch_size);
        Self {
            state: Mutex::new(SizerState {
                history: VecDeque::with_capacity(config.history_window.max(1)),
                current,
                optimizer_failures: 0,
            }),
            config,
            policy,
            fallback: HeuristicPolicy,
        }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    pub fn record(&self, sample: ThroughputSample) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.history.push_back(sample);
        while st.history.len() > self.config.history_window.max(1) {
            st.history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<ThroughputSample> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.history.iter().copied().collect()
    }

    /// Seed the window, e.g. from a checkpoint's recent metrics.
    pub fn restore_history(&self, samples: &[ThroughputSample]) {
        for s in samples {
            self.record(*s);
        }
    }

    pub fn current_size(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).current
    }

    /// Compute and remember the next batch size.
    pub fn next_size(&self, load: &LoadSignal) -> usize {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let window: Vec<ThroughputSample> = st.history.iter().copied().collect();
        let bounds = (self.config.min_batch_size, self.config.max_batch_size);

        let proposed = if window.len() >= self.config.min_samples {
            match self.policy.propose(&window, st.current, load, bounds) {
                Ok(size) => {
                    st.optimizer_failures = 0;
                    Some(size)
                }
                // A steady run has nothing to fit; hold the size it is running at.
                Err(SizingError::Degenerate) => Some(st.current),
                Err(e) => {
                    st.optimizer_failures = st.optimizer_failures.saturating_add(1);
                    tracing::debug!(
                        error = %e,
                        failures = st.optimizer_failures,
                        "batch size optimizer failed"
                    );
                    None
                }
            }
        } else {
            None
        };

        let size = match proposed {
            Some(size) => size,
            None if st.optimizer_failures >= self.config.max_optimizer_failures => {
                self.config.conservative_size()
            }
            None => self
                .fallback
                .propose(&window, st.current, load, bounds)
                .unwrap_or(st.current),
        };

        let size = self.config.clamp(size);
        if size != st.current {
            tracing::debug!(from = st.current, to = size, "batch size adjusted");
        }
        st.current = size;
        size
    }
}
