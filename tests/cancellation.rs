//! Hung work and cancellation never keep a run from returning.

use async_trait::async_trait;
use batchline::execution::ExecutionConfig;
use batchline::pool::{NoopResourceFactory, PoolConfig, ResourceFactory};
use batchline::recovery::RecoveryConfig;
use batchline::sizing::SizingConfig;
use batchline::{
    BatchOrchestrator, ConnectionPool, FnProcessor, RetryPolicy, RuntimeConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn quick_retry(max_retries: u32, base: Duration) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_retries(max_retries)
        .with_base_delay(base)
        .with_jitter(0.0)
}

#[tokio::test]
async fn test_hung_processor_fails_batch_within_timeouts() {
    let orchestrator = BatchOrchestrator::builder(NoopResourceFactory)
        .with_config(
            RuntimeConfig::new()
                .with_sizing(SizingConfig::new().with_bounds(5, 5))
                .with_retry(quick_retry(0, Duration::from_millis(1)))
                .with_recovery(RecoveryConfig::new().with_retry(quick_retry(1, Duration::from_millis(1))))
                .with_execution(
                    ExecutionConfig::new()
                        .with_concurrency(2)
                        .with_batch_timeout(Some(Duration::from_millis(50))),
                ),
        )
        .build()
        .unwrap();
    let processor = Arc::new(FnProcessor::new(|items: Vec<u32>, _index: usize| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<_, anyhow::Error>(items.len())
    }));

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.process("hung", (0..5).collect(), processor),
    )
    .await
    .expect("run returns once every attempt has timed out")
    .unwrap();

    assert!(report.is_complete());
    assert_eq!((report.processed, report.failed), (0, 5));
    assert_eq!(report.recoveries.len(), 1);
    assert!(report.recoveries[0].outcome.is_err());
    // Timed-out checkouts are returned by a spawned release.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(orchestrator.pool().stats().busy, 0);
}

#[tokio::test]
async fn test_cancel_during_recovery_backoff_leaves_batch_owed() {
    let token = CancellationToken::new();
    let orchestrator = BatchOrchestrator::builder(NoopResourceFactory)
        .with_config(
            RuntimeConfig::new()
                .with_sizing(SizingConfig::new().with_bounds(10, 10))
                .with_retry(quick_retry(0, Duration::from_millis(1)))
                .with_recovery(RecoveryConfig::new().with_retry(quick_retry(3, Duration::from_secs(30)))),
        )
        .with_cancellation(token.clone())
        .build()
        .unwrap();
    let processor = Arc::new(FnProcessor::new(|_items: Vec<u32>, _index: usize| async move {
        Err::<usize, _>(anyhow::anyhow!("connection reset by peer"))
    }));
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.process("owed", (0..10).collect(), processor),
    )
    .await
    .expect("cancellation interrupts the recovery backoff")
    .unwrap();

    assert!(report.cancelled);
    assert!(!report.is_complete());
    assert_eq!((report.processed, report.failed), (0, 0));
    assert_eq!(report.items_consumed, 0);
    assert!(orchestrator.dead_letters().is_empty());
}

/// Takes longer to connect than callers are willing to wait.
struct SlowFactory;

#[async_trait]
impl ResourceFactory for SlowFactory {
    type Handle = u8;

    async fn create(&self) -> anyhow::Result<u8> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(1)
    }

    async fn health_check(&self, _handle: &u8) -> bool {
        true
    }
}

#[tokio::test]
async fn test_abandoned_acquire_does_not_leak_capacity() {
    let pool = ConnectionPool::new(
        SlowFactory,
        PoolConfig::new()
            .with_bounds(0, 1)
            .with_acquire_timeout(Duration::from_secs(2)),
    );
    let gave_up = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
    assert!(gave_up.is_err());
    assert_eq!(pool.stats().pending_creates, 0);

    let res = pool.acquire().await.unwrap();
    assert_eq!(*res.handle(), 1);
    pool.release(res).await;
    let stats = pool.stats();
    assert_eq!(stats.busy, 0);
    assert!(stats.total() <= 1, "{:?}", stats);
}
