//! The pool bound holds under concurrent load, directly and through a run.

use async_trait::async_trait;
use batchline::execution::ExecutionConfig;
use batchline::pool::{PoolConfig, ResourceFactory};
use batchline::sizing::SizingConfig;
use batchline::{Batch, BatchOrchestrator, ConnectionPool, Processor, RuntimeConfig};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Hands out numbered connections.
#[derive(Default)]
struct NumberedFactory {
    next: AtomicU64,
}

#[async_trait]
impl ResourceFactory for NumberedFactory {
    type Handle = u64;

    async fn create(&self) -> anyhow::Result<u64> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    async fn health_check(&self, _handle: &u64) -> bool {
        true
    }
}

/// Records which connections are in use at the same time.
#[derive(Default)]
struct ExclusiveUse {
    in_use: Mutex<HashSet<u64>>,
    peak: AtomicUsize,
    shared: AtomicUsize,
}

#[async_trait]
impl Processor<u32, usize, u64> for ExclusiveUse {
    async fn process(&self, batch: &Batch<u32>, conn: &u64) -> anyhow::Result<usize> {
        {
            let mut in_use = self.in_use.lock().unwrap();
            if !in_use.insert(*conn) {
                self.shared.fetch_add(1, Ordering::SeqCst);
            }
            self.peak.fetch_max(in_use.len(), Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(5 + (batch.index % 3) as u64)).await;
        self.in_use.lock().unwrap().remove(conn);
        Ok(batch.len())
    }
}

#[tokio::test]
async fn test_busy_never_exceeds_max_under_contention() {
    let pool = ConnectionPool::new(
        NumberedFactory::default(),
        PoolConfig::new()
            .with_bounds(0, 4)
            .with_acquire_timeout(Duration::from_secs(5)),
    );
    let peak = Arc::new(AtomicUsize::new(0));
    let holding = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..32u64 {
        let pool = pool.clone();
        let peak = peak.clone();
        let holding = holding.clone();
        tasks.push(tokio::spawn(async move {
            let res = pool.acquire().await?;
            let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let stats = pool.stats();
            assert!(stats.busy <= stats.max_connections, "{:?}", stats);
            assert!(stats.total() <= 4, "{:?}", stats);
            tokio::time::sleep(Duration::from_millis(1 + i % 4)).await;
            holding.fetch_sub(1, Ordering::SeqCst);
            pool.release(res).await;
            Ok::<_, batchline::Error>(())
        }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    let stats = pool.stats();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.waiters, 0);
    assert!(stats.created_total <= 4);
}

#[tokio::test]
async fn test_run_wider_than_pool_shares_no_connection() {
    let orchestrator = BatchOrchestrator::builder(NumberedFactory::default())
        .with_config(
            RuntimeConfig::new()
                .with_sizing(SizingConfig::new().with_bounds(5, 5))
                .with_pool(
                    PoolConfig::new()
                        .with_bounds(1, 3)
                        .with_acquire_timeout(Duration::from_secs(5)),
                )
                .with_execution(ExecutionConfig::new().with_concurrency(8)),
        )
        .build()
        .unwrap();
    let processor = Arc::new(ExclusiveUse::default());

    let report = orchestrator
        .process("contention", (0..200).collect(), processor.clone())
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.processed, 200);
    assert_eq!(processor.shared.load(Ordering::SeqCst), 0);
    assert!(processor.peak.load(Ordering::SeqCst) <= 3);
    let stats = orchestrator.pool().stats();
    assert_eq!(stats.busy, 0);
    assert!(stats.created_total <= 3);
}

#[tokio::test]
async fn test_dropped_guard_returns_its_slot() {
    let pool = ConnectionPool::new(
        NumberedFactory::default(),
        PoolConfig::new()
            .with_bounds(0, 1)
            .with_acquire_timeout(Duration::from_millis(500)),
    );
    {
        let guard = pool.acquire_guard().await.unwrap();
        assert_eq!(guard.handle(), Some(&0));
        assert_eq!(pool.stats().busy, 1);
    }
    let again = pool.acquire().await.unwrap();
    assert_eq!(*again.handle(), 0);
    pool.release(again).await;
    assert_eq!(pool.stats().available, 1);
}
