use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub operation_key: String,
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub consecutive_failures: u32,
    pub half_open_trials_used: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set how long the breaker stays open before trial calls are allowed
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// A state change worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
}

/// One admitted call. Resolve it with [`BreakerPermit::success`] or
/// [`BreakerPermit::failure`].
#[must_use = "an unresolved half-open trial reopens the breaker when dropped"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) -> Option<BreakerTransition> {
        self.resolved = true;
        self.breaker.on_success()
    }

    pub fn failure(mut self) -> Option<BreakerTransition> {
        self.resolved = true;
        self.breaker.on_failure()
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.abandon_trial();
        }
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    half_open_trials_used: u32,
}

/// Per-operation circuit breaker.
///
/// - Counts consecutive failures while closed
/// - Opens at the threshold and fails fast until the recovery timeout elapses
/// - Then admits at most `half_open_max_calls` trial calls
pub struct CircuitBreaker {
    key: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                half_open_trials_used: 0,
            }),
        }
    }

    // The guarded state is plain counters; a panic mid-update cannot leave it torn.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Admit or reject one call. May move `Open` to `HalfOpen`.
    ///
    /// The returned permit records the call's outcome. A half-open trial whose
    /// permit is dropped unresolved reopens the breaker, so a timed-out or
    /// cancelled trial never holds the breaker half-open.
    pub fn allow(&self) -> Result<BreakerPermit<'_>> {
        let mut st = self.lock();
        let trial = match st.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = st.last_failure_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                let timeout = self.cfg.recovery_timeout();
                if elapsed < timeout {
                    return Err(Error::CircuitOpen {
                        operation: self.key.clone(),
                        retry_after_ms: (timeout - elapsed).as_millis() as u64,
                    });
                }
                tracing::debug!(operation = %self.key, "circuit breaker half-open");
                st.state = CircuitState::HalfOpen;
                st.half_open_trials_used = 1;
                true
            }
            CircuitState::HalfOpen => {
                if st.half_open_trials_used < self.cfg.half_open_max_calls {
                    st.half_open_trials_used += 1;
                    true
                } else {
                    return Err(Error::CircuitOpen {
                        operation: self.key.clone(),
                        retry_after_ms: 0,
                    });
                }
            }
        };
        Ok(BreakerPermit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    fn abandon_trial(&self) {
        let mut st = self.lock();
        if st.state != CircuitState::HalfOpen {
            return;
        }
        tracing::warn!(operation = %self.key, "half-open trial abandoned, reopening circuit breaker");
        st.state = CircuitState::Open;
        st.half_open_trials_used = 0;
        st.last_failure_at = Some(Instant::now());
    }

    pub fn on_success(&self) -> Option<BreakerTransition> {
        let mut st = self.lock();
        let from = st.state;
        st.consecutive_failures = 0;
        st.half_open_trials_used = 0;
        st.state = CircuitState::Closed;
        (from != CircuitState::Closed).then_some(BreakerTransition {
            from,
            to: CircuitState::Closed,
            consecutive_failures: 0,
        })
    }

    pub fn on_failure(&self) -> Option<BreakerTransition> {
        let mut st = self.lock();
        let from = st.state;
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.last_failure_at = Some(Instant::now());
        let open = match from {
            CircuitState::HalfOpen | CircuitState::Open => true,
            CircuitState::Closed => st.consecutive_failures >= self.cfg.failure_threshold,
        };
        if !open {
            return None;
        }
        st.state = CircuitState::Open;
        st.half_open_trials_used = 0;
        (from != CircuitState::Open).then_some(BreakerTransition {
            from,
            to: CircuitState::Open,
            consecutive_failures: st.consecutive_failures,
        })
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Force the breaker closed, e.g. after a manual fix.
    pub fn reset(&self) {
        let mut st = self.lock();
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.half_open_trials_used = 0;
        st.last_failure_at = None;
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.lock();
        let open_remaining_ms = match (st.state, st.last_failure_at) {
            (CircuitState::Open, Some(at)) => self
                .cfg
                .recovery_timeout()
                .checked_sub(at.elapsed())
                .filter(|d| !d.is_zero())
                .map(|d| d.as_millis() as u64),
            _ => None,
        };
        CircuitBreakerSnapshot {
            operation_key: self.key.clone(),
            state: st.state,
            failure_threshold: self.cfg.failure_threshold,
            recovery_timeout_ms: self.cfg.recovery_timeout_ms,
            consecutive_failures: st.consecutive_failures,
            half_open_trials_used: st.half_open_trials_used,
            open_remaining_ms,
        }
    }
}

/// One breaker per operation key, created on first use and kept for the registry's lifetime.
pub struct CircuitBreakerRegistry {
    cfg: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.cfg.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let map = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<_> = map.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.operation_key.cmp(&b.operation_key));
        out
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
