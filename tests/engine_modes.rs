//! Every scheduling mode returns results in batch order.

use batchline::execution::ExecutionConfig;
use batchline::pool::NoopResourceFactory;
use batchline::sizing::SizingConfig;
use batchline::{
    BatchOrchestrator, ClassifiedError, ErrorCategory, ExecutionMode, FnProcessor, RetryPolicy,
    RuntimeConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MODES: [ExecutionMode; 4] = [
    ExecutionMode::Sequential,
    ExecutionMode::BoundedParallel,
    ExecutionMode::Pipelined,
    ExecutionMode::WorkStealing,
];

fn orchestrator(mode: ExecutionMode, fail_fast: bool) -> BatchOrchestrator<NoopResourceFactory> {
    BatchOrchestrator::builder(NoopResourceFactory)
        .with_config(
            RuntimeConfig::new()
                .with_sizing(SizingConfig::new().with_bounds(10, 20))
                .with_retry(RetryPolicy::new().with_max_retries(0))
                .with_execution(
                    ExecutionConfig::new()
                        .with_mode(mode)
                        .with_concurrency(3)
                        .with_fail_fast(fail_fast),
                ),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_all_modes_keep_item_order() {
    for mode in MODES {
        // Later batches finish first.
        let processor = Arc::new(FnProcessor::new(|items: Vec<u32>, index: usize| async move {
            tokio::time::sleep(Duration::from_millis(12u64.saturating_sub(index as u64 * 2))).await;
            Ok::<_, anyhow::Error>(items)
        }));
        let report = orchestrator(mode, false)
            .process(mode.as_str(), (0..95).collect(), processor)
            .await
            .unwrap();

        assert!(report.is_complete(), "{}", mode.as_str());
        for (i, r) in report.results.iter().enumerate() {
            assert_eq!(r.index, i, "{}", mode.as_str());
        }
        let flat: Vec<u32> = report.outputs().flatten().copied().collect();
        assert_eq!(flat, (0..95).collect::<Vec<u32>>(), "{}", mode.as_str());
    }
}

#[tokio::test]
async fn test_failure_is_isolated_without_fail_fast() {
    for mode in MODES {
        let processor = Arc::new(FnProcessor::new(|items: Vec<u32>, index: usize| async move {
            if index == 1 {
                return Err(anyhow::Error::new(ClassifiedError::new(
                    ErrorCategory::Validation,
                    "record fails schema check",
                )));
            }
            Ok(items.len())
        }));
        let report = orchestrator(mode, false)
            .process("isolated", (0..60).collect(), processor)
            .await
            .unwrap();

        assert!(report.is_complete(), "{}", mode.as_str());
        assert!(!report.stopped_on_failure);
        assert_eq!(report.failed_batches().count(), 1, "{}", mode.as_str());
        assert!(report.results[1].is_failed());
        assert_eq!(report.processed + report.failed, 60);
    }
}

#[tokio::test]
async fn test_fail_fast_stops_dispatching_new_waves() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let processor = Arc::new(FnProcessor::new(move |items: Vec<u32>, index: usize| {
        c.fetch_add(1, Ordering::SeqCst);
        async move {
            if index == 0 {
                anyhow::bail!("invalid header row");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(items.len())
        }
    }));
    let report = orchestrator(ExecutionMode::Sequential, true)
        .process("fail-fast", (0..200).collect(), processor)
        .await
        .unwrap();

    assert!(report.stopped_on_failure);
    assert!(!report.is_complete());
    assert!(report.results[0].is_failed());
    assert!(report.results.iter().skip(1).all(|r| !r.was_dispatched()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(report.items_consumed < 200);
}
