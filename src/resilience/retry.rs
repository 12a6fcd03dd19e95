//! Retry coordinator.
//!
//! Wraps a fallible async operation with circuit-breaker admission, error
//! classification and backed-off retries. The loop is iterative with an explicit
//! attempt counter; a cancellation token interrupts the backoff sleep.

use super::backoff::{apply_jitter, base_delay, AdaptiveDelayTracker, BackoffStrategy};
use super::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::classify::{Classification, ClassifyContext, RuleBasedClassifier, SharedClassifier};
use crate::events::{emit, now_ms, noop_sink, RuntimeEvent, SharedEventSink};
use crate::{Error, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Configuration for retry logic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Symmetric jitter fraction, e.g. `0.1` for ±10%.
    pub jitter_pct: f64,
    /// Overrides the strategy suggested by the classifier when set.
    pub strategy: Option<BackoffStrategy>,
    /// Per-attempt timeout; an attempt that exceeds it counts as a timeout failure.
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter_pct: 0.1,
            strategy: None,
            attempt_timeout_ms: None,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay_ms = d.as_millis() as u64;
        self
    }
    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay_ms = d.as_millis() as u64;
        self
    }
    pub fn with_jitter(mut self, pct: f64) -> Self {
        self.jitter_pct = pct;
        self
    }
    pub fn with_strategy(mut self, s: BackoffStrategy) -> Self {
        self.strategy = Some(s);
        self
    }
    pub fn with_attempt_timeout(mut self, d: Duration) -> Self {
        self.attempt_timeout_ms = Some(d.as_millis() as u64);
        self
    }
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// One failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttemptRecord {
    pub operation_id: String,
    /// 1-based.
    pub attempt: u32,
    pub error: String,
    pub classification: Classification,
    pub timestamp_ms: u64,
    /// Delay slept before the next attempt; `None` when the loop gave up here.
    pub delay_ms: Option<u64>,
}

/// Outcome counters kept per operation key after each execution resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub successes: u64,
    pub exhausted: u64,
    pub retries: u64,
}

const STATS_CAPACITY: usize = 1024;
const ADAPTIVE_WINDOW: usize = 50;

pub struct RetryCoordinator {
    breakers: Arc<CircuitBreakerRegistry>,
    classifier: SharedClassifier,
    adaptive: AdaptiveDelayTracker,
    stats: Mutex<LruCache<String, OperationStats>>,
    events: SharedEventSink,
}

impl RetryCoordinator {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, classifier: SharedClassifier) -> Self {
        let cap = NonZeroUsize::new(STATS_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            breakers,
            classifier,
            adaptive: AdaptiveDelayTracker::new(STATS_CAPACITY, ADAPTIVE_WINDOW),
            stats: Mutex::new(LruCache::new(cap)),
            events: noop_sink(),
        }
    }

    pub fn with_events(mut self, events: SharedEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn classifier(&self) -> &SharedClassifier {
        &self.classifier
    }

    pub fn adaptive(&self) -> &AdaptiveDelayTracker {
        &self.adaptive
    }

    pub fn operation_stats(&self, key: &str) -> OperationStats {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.get(key).copied().unwrap_or_default()
    }

    fn bump_stats(&self, key: &str, f: impl FnOnce(&mut OperationStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(s) = stats.get_mut(key) {
            f(s);
            return;
        }
        let mut s = OperationStats::default();
        f(&mut s);
        stats.put(key.to_string(), s);
    }

    /// Delay before the attempt following the `failed_attempt`-th failure.
    pub fn delay_for(
        &self,
        key: &str,
        strategy: BackoffStrategy,
        failed_attempt: u32,
        policy: &RetryPolicy,
    ) -> Duration {
        let raw = match strategy {
            BackoffStrategy::Adaptive => {
                self.adaptive
                    .blended_delay(key, failed_attempt, policy.base_delay())
            }
            other => base_delay(other, failed_attempt, policy.base_delay()),
        };
        apply_jitter(raw, policy.jitter_pct).min(policy.max_delay())
    }

    /// Run `op` under the breaker for `key`, retrying per `policy` and the classifier.
    pub async fn execute<T, F, Fut>(&self, key: &str, op: F, policy: &RetryPolicy) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_with_cancel(key, op, policy, &CancellationToken::new(), None)
            .await
    }

    /// Like [`RetryCoordinator::execute`], but a cancelled token ends the loop at the next
    /// backoff sleep. `batch_index` is carried into the classification context.
    pub async fn execute_with_cancel<T, F, Fut>(
        &self,
        key: &str,
        mut op: F,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        batch_index: Option<usize>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let operation_id = Uuid::new_v4().to_string();
        let breaker = self.breakers.get(key);
        let mut history: Vec<RetryAttemptRecord> = Vec::new();
        let mut attempt: u32 = 0;
        let mut pending_delay: Option<Duration> = None;

        loop {
            attempt = attempt.saturating_add(1);
            let permit = breaker.allow()?;

            let started = Instant::now();
            let fut = op();
            let res = match policy.attempt_timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::Error::new(Error::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })),
                },
                None => fut.await,
            };

            let err = match res {
                Ok(value) => {
                    if let Some(d) = pending_delay {
                        self.adaptive.record(key, d, true);
                    }
                    if let Some(t) = permit.success() {
                        debug!(operation = key, from = ?t.from, "circuit breaker closed");
                        emit(
                            &self.events,
                            RuntimeEvent::BreakerClosed {
                                operation: key.to_string(),
                            },
                        )
                        .await;
                    }
                    self.bump_stats(key, |s| s.successes += 1);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if let Some(d) = pending_delay.take() {
                self.adaptive.record(key, d, false);
            }
            if let Some(t) = permit.failure() {
                if t.to == CircuitState::Open {
                    warn!(
                        operation = key,
                        consecutive_failures = t.consecutive_failures,
                        "circuit breaker opened"
                    );
                    emit(
                        &self.events,
                        RuntimeEvent::BreakerOpened {
                            operation: key.to_string(),
                            consecutive_failures: t.consecutive_failures,
                        },
                    )
                    .await;
                }
            }

            let mut ctx = ClassifyContext::new(key).with_attempt(attempt);
            ctx.batch_index = batch_index;
            let classification = self.classifier.classify(&err, &ctx);
            let retries_used = attempt - 1;
            let budget = policy.max_retries.min(classification.max_retries);
            let will_retry = classification.retryable && retries_used < budget;
            if will_retry && cancel.is_cancelled() {
                debug!(operation = key, attempt, "retry skipped, cancelled");
                return Err(Error::Cancelled);
            }

            let delay = will_retry.then(|| {
                let strategy = policy.strategy.unwrap_or(classification.backoff);
                self.delay_for(key, strategy, attempt, policy)
            });

            history.push(RetryAttemptRecord {
                operation_id: operation_id.clone(),
                attempt,
                error: format!("{:#}", err),
                classification: classification.clone(),
                timestamp_ms: now_ms(),
                delay_ms: delay.map(|d| d.as_millis() as u64),
            });

            let Some(delay) = delay else {
                self.bump_stats(key, |s| s.exhausted += 1);
                warn!(
                    operation = key,
                    attempts = attempt,
                    category = %classification.category,
                    retryable = classification.retryable,
                    "operation gave up"
                );
                return Err(Error::RetryExhausted {
                    operation: key.to_string(),
                    attempts: attempt,
                    history,
                    classification,
                    last_error: format!("{:#}", err),
                });
            };

            debug!(
                operation = key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                category = %classification.category,
                "retrying after failure"
            );
            self.bump_stats(key, |s| s.retries += 1);
            emit(
                &self.events,
                RuntimeEvent::RetryScheduled {
                    operation: key.to_string(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    category: classification.category,
                },
            )
            .await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
            pending_delay = Some(delay);
        }
    }
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(
            Arc::new(CircuitBreakerRegistry::default()),
            Arc::new(RuleBasedClassifier::new()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ClassifiedError, ErrorCategory};
    use crate::resilience::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator(threshold: u32) -> RetryCoordinator {
        RetryCoordinator::new(
            Arc::new(CircuitBreakerRegistry::new(
                CircuitBreakerConfig::new().with_failure_threshold(threshold),
            )),
            Arc::new(RuleBasedClassifier::new()),
        )
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(max_retries)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(0.0)
            .with_strategy(BackoffStrategy::Fixed)
    }

    fn network_error() -> anyhow::Error {
        anyhow::Error::new(ClassifiedError::new(ErrorCategory::Network, "connection reset"))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let rc = coordinator(100);
        let calls = AtomicU32::new(0);
        let out = rc
            .execute(
                "op",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(network_error())
                    } else {
                        Ok(n)
                    }
                },
                &fast_policy(5),
            )
            .await
            .unwrap();
        assert_eq!(out, 3);
        let stats = rc.operation_stats("op");
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test]
    async fn test_budget_is_min_of_policy_and_classification() {
        let rc = coordinator(100);
        let calls = AtomicU32::new(0);
        // Unknown errors carry a budget of one retry.
        let err = rc
            .execute(
                "op",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("mystery"))
                },
                &fast_policy(10),
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match err {
            Error::RetryExhausted {
                attempts, history, ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(history.len(), 2);
                assert!(history[0].delay_ms.is_some());
                assert!(history[1].delay_ms.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_fails_on_first_attempt() {
        let rc = coordinator(100);
        let calls = AtomicU32::new(0);
        let err = rc
            .execute(
                "op",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::Error::new(ClassifiedError::new(
                        ErrorCategory::Validation,
                        "bad row",
                    )))
                },
                &fast_policy(5),
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.category_hint(), Some(ErrorCategory::Validation));
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_timeout() {
        let rc = coordinator(100);
        let policy = fast_policy(0).with_attempt_timeout(Duration::from_millis(10));
        let err = rc
            .execute(
                "slow",
                || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, anyhow::Error>(())
                },
                &policy,
            )
            .await
            .unwrap_err();
        assert_eq!(err.category_hint(), Some(ErrorCategory::Timeout));
    }

    #[tokio::test]
    async fn test_open_breaker_stops_retry_loop() {
        let rc = coordinator(2);
        let calls = AtomicU32::new(0);
        let err = rc
            .execute(
                "flaky",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(network_error())
                },
                &fast_policy(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let rc = coordinator(100);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new()
            .with_max_retries(5)
            .with_base_delay(Duration::from_secs(10))
            .with_strategy(BackoffStrategy::Fixed);
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        let started = Instant::now();
        let err = rc
            .execute_with_cancel(
                "op",
                || async { Err::<(), _>(network_error()) },
                &policy,
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_trial_dropped_by_caller_timeout_does_not_wedge_breaker() {
        let rc = RetryCoordinator::new(
            Arc::new(CircuitBreakerRegistry::new(
                CircuitBreakerConfig::new()
                    .with_failure_threshold(1)
                    .with_recovery_timeout(Duration::from_millis(20))
                    .with_half_open_max_calls(1),
            )),
            Arc::new(RuleBasedClassifier::new()),
        );
        let _ = rc
            .execute("export", || async { Err::<(), _>(network_error()) }, &fast_policy(0))
            .await;
        assert_eq!(rc.breakers().get("export").state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The half-open trial hangs and the caller gives up on it.
        let hung = tokio::time::timeout(
            Duration::from_millis(10),
            rc.execute(
                "export",
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, anyhow::Error>(())
                },
                &fast_policy(0),
            ),
        )
        .await;
        assert!(hung.is_err());
        assert_eq!(rc.breakers().get("export").state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let out = rc
            .execute("export", || async { Ok::<_, anyhow::Error>(7) }, &fast_policy(0))
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(rc.breakers().get("export").state(), CircuitState::Closed);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let rc = coordinator(5);
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3))
            .with_jitter(0.0);
        let d = rc.delay_for("op", BackoffStrategy::Exponential, 5, &policy);
        assert_eq!(d, Duration::from_secs(3));
    }
}
