//! 弹性模式模块：提供熔断器、退避重试与死信队列等可靠性保障机制。
//!
//! # Resilience Primitives Module
//!
//! This module wraps fallible operations (database calls, LLM calls, any I/O) so
//! that transient failures are retried and persistent ones fail fast.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per-operation circuit breaker and its registry |
//! | [`backoff`] | Backoff strategies, jitter and the adaptive delay learner |
//! | [`retry`] | [`RetryCoordinator`]: classified, backed-off retries |
//! | [`dead_letter`] | Bounded store of exhausted operations |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: normal operation, consecutive failures are counted
//! - **Open**: threshold reached, calls fail fast with [`crate::Error::CircuitOpen`]
//! - **Half-Open**: recovery timeout elapsed, a bounded number of trial calls pass
//!
//! ```rust
//! use batchline::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(5)
//!     .with_recovery_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new("classify_llm", config);
//!
//! if let Ok(permit) = breaker.allow() {
//!     // Make the call...
//!     permit.success();
//! };
//! ```
//!
//! ## Retry Coordinator
//!
//! ```rust,no_run
//! use batchline::resilience::{RetryCoordinator, RetryPolicy};
//!
//! # async fn run() -> batchline::Result<()> {
//! let coordinator = RetryCoordinator::default();
//! let rows = coordinator
//!     .execute("load_rows", || async { Ok::<_, anyhow::Error>(42) }, &RetryPolicy::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod dead_letter;
pub mod retry;

pub use backoff::{apply_jitter, base_delay, AdaptiveDelayTracker, BackoffStrategy};
pub use circuit_breaker::{
    BreakerPermit, BreakerTransition, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerSnapshot, CircuitState,
};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use retry::{OperationStats, RetryAttemptRecord, RetryCoordinator, RetryPolicy};
