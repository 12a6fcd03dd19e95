//! # batchline
//!
//! 面向批量事务分类等场景的弹性与吞吐运行时：自适应批次大小、连接池、分类重试与熔断、并行执行以及恢复与断点续跑。
//!
//! Resilience and throughput runtime for large batched workloads whose
//! per-item work calls slow, failure-prone external services.
//!
//! ## Overview
//!
//! A caller hands an item list and a [`Processor`] to a [`BatchOrchestrator`].
//! The orchestrator cuts the list into batches whose size adapts to measured
//! throughput and load, runs them concurrently with pooled resources, retries
//! transient failures with classified backoff behind per-operation circuit
//! breakers, and routes whatever still fails to a recovery manager.
//! Checkpoints let an interrupted run resume without double counting.
//!
//! ## Core Guarantees
//!
//! - **Ordered results**: `results[i]` always belongs to batch `i`, whatever the completion order
//! - **Isolation**: one batch failing never aborts its siblings unless `fail_fast` is set
//! - **Bounded resources**: the pool never hands out more than `max_connections` resources
//! - **Exact accounting**: a finished run has `processed + failed == total`, across resumes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batchline::pool::NoopResourceFactory;
//! use batchline::{BatchOrchestrator, FnProcessor, RuntimeConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> batchline::Result<()> {
//!     batchline::logging::init_logging("batchline=info");
//!
//!     let config = RuntimeConfig::from_yaml_str("sizing: { min_batch_size: 10, max_batch_size: 50 }")?;
//!     let orchestrator = BatchOrchestrator::builder(NoopResourceFactory)
//!         .with_config(config)
//!         .build()?;
//!
//!     let processor = Arc::new(FnProcessor::new(|items: Vec<u64>, _batch_index: usize| async move {
//!         Ok::<_, anyhow::Error>(items.iter().sum::<u64>())
//!     }));
//!     let report = orchestrator.process("import-2024-06", (1..=1_000).collect(), processor).await?;
//!     assert_eq!(report.processed + report.failed, report.total);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`orchestrator`] | Run driver, builder, processor trait, run report |
//! | [`sizing`] | Adaptive batch sizing from throughput samples and load |
//! | [`pool`] | Bounded, health-checked resource pool with FIFO waiters |
//! | [`resilience`] | Circuit breakers, backoff, retry coordinator, dead letters |
//! | [`classify`] | Error categories and the rule-based classifier |
//! | [`execution`] | Sequential, bounded-parallel, pipelined and work-stealing scheduling |
//! | [`recovery`] | Recovery strategies, checkpoints, consistency checks |
//! | [`batch`] | Batches, result slots, partition rules |
//! | [`events`] | Fire-and-forget runtime event sinks |
//! | [`config`] | Serde-loadable runtime configuration |
//! | [`logging`] | `tracing-subscriber` setup |

pub mod batch;
pub mod classify;
pub mod config;
pub mod events;
pub mod execution;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod recovery;
pub mod resilience;
pub mod sizing;

// Re-export main types for convenience
pub use batch::{Batch, BatchOutcome, BatchResult};
pub use classify::{Classification, ClassifiedError, ErrorCategory, ErrorClassifier, Severity};
pub use config::RuntimeConfig;
pub use events::{EventSink, RuntimeEvent};
pub use execution::{ExecutionMode, ParallelExecutionEngine};
pub use orchestrator::{BatchOrchestrator, BatchOrchestratorBuilder, FnProcessor, Processor, RunReport};
pub use pool::{ConnectionPool, ResourceFactory};
pub use recovery::{Checkpoint, CheckpointStore, RecoveryManager, RecoveryOutcome};
pub use resilience::{CircuitBreaker, RetryCoordinator, RetryPolicy};
pub use sizing::{BatchSizer, LoadSignal};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
