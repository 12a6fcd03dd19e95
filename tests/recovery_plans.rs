//! Batches that fail past the retry loop get the recovery their processor declares.

use async_trait::async_trait;
use batchline::execution::ExecutionConfig;
use batchline::pool::NoopResourceFactory;
use batchline::recovery::{FnAction, RecoveryPlan, RepairAction};
use batchline::sizing::SizingConfig;
use batchline::{
    Batch, BatchOrchestrator, ClassifiedError, Error, ErrorCategory, FnProcessor, Processor,
    RecoveryOutcome, RetryPolicy, RuntimeConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn orchestrator() -> BatchOrchestrator<NoopResourceFactory> {
    BatchOrchestrator::builder(NoopResourceFactory)
        .with_config(
            RuntimeConfig::new()
                .with_sizing(SizingConfig::new().with_bounds(10, 10))
                .with_retry(
                    RetryPolicy::new()
                        .with_max_retries(1)
                        .with_base_delay(Duration::from_millis(1))
                        .with_jitter(0.0),
                )
                .with_execution(ExecutionConfig::new().with_concurrency(2)),
        )
        .build()
        .unwrap()
}

struct NullAccountRepair {
    repaired: AtomicUsize,
}

#[async_trait]
impl RepairAction for NullAccountRepair {
    fn name(&self) -> &str {
        "null_gl_accounts"
    }

    async fn detect(&self) -> anyhow::Result<usize> {
        Ok(4)
    }

    async fn repair(&self) -> anyhow::Result<usize> {
        self.repaired.fetch_add(4, Ordering::SeqCst);
        Ok(4)
    }
}

/// Rejects batch 1 as malformed and offers a repair for it.
struct LedgerWriter {
    repair: Arc<NullAccountRepair>,
    planned_for: Mutex<Vec<usize>>,
}

#[async_trait]
impl Processor<u32, usize, ()> for LedgerWriter {
    async fn process(&self, batch: &Batch<u32>, _conn: &()) -> anyhow::Result<usize> {
        if batch.index == 1 {
            return Err(anyhow::Error::new(ClassifiedError::new(
                ErrorCategory::Validation,
                "journal line has no GL account",
            )));
        }
        Ok(batch.len())
    }

    fn recovery_plan(&self, batch: &Batch<u32>, _error: &Error) -> RecoveryPlan {
        self.planned_for.lock().unwrap().push(batch.index);
        RecoveryPlan::new().with_repair(self.repair.clone())
    }
}

#[tokio::test]
async fn test_validation_failure_runs_declared_repair() {
    let repair = Arc::new(NullAccountRepair {
        repaired: AtomicUsize::new(0),
    });
    let processor = Arc::new(LedgerWriter {
        repair: repair.clone(),
        planned_for: Mutex::new(Vec::new()),
    });

    let report = orchestrator()
        .process("ledger", (0..40).collect(), processor.clone())
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!((report.processed, report.failed), (30, 10));
    assert_eq!(*processor.planned_for.lock().unwrap(), vec![1]);
    assert_eq!(repair.repaired.load(Ordering::SeqCst), 4);
    assert_eq!(report.recoveries.len(), 1);
    assert_eq!(report.recoveries[0].batch_index, 1);
    assert_eq!(
        report.recoveries[0].outcome,
        Ok(RecoveryOutcome::Repaired {
            detected: 4,
            repaired: 4
        })
    );
    // Repair fixes stored data; the batch itself stays failed.
    assert!(report.results[1].is_failed());
}

#[tokio::test]
async fn test_orchestration_failure_runs_compensations_in_order() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let step = |name: &'static str| {
        let log = log.clone();
        Arc::new(FnAction::new(name, move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok::<(), anyhow::Error>(())
            }
        }))
    };
    let plan = RecoveryPlan::new()
        .with_compensation(step("void_invoice"))
        .with_compensation(step("release_reservation"));
    let processor = Arc::new(
        FnProcessor::new(|items: Vec<u32>, index: usize| async move {
            if index == 2 {
                return Err(anyhow::Error::new(ClassifiedError::new(
                    ErrorCategory::Orchestration,
                    "invoice partially written",
                )));
            }
            Ok(items.len())
        })
        .with_recovery_plan(plan),
    );

    let report = orchestrator()
        .process("invoices", (0..30).collect(), processor)
        .await
        .unwrap();

    assert_eq!(report.failed, 10);
    assert_eq!(report.recoveries.len(), 1);
    assert_eq!(report.recoveries[0].outcome, Ok(RecoveryOutcome::Compensated { actions: 2 }));
    assert_eq!(*log.lock().unwrap(), vec!["void_invoice", "release_reservation"]);
}

#[tokio::test]
async fn test_rollback_steps_undo_in_reverse() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let step = |name: &'static str| {
        let log = log.clone();
        Arc::new(FnAction::new(name, move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok::<(), anyhow::Error>(())
            }
        }))
    };
    let plan = RecoveryPlan::new()
        .with_rollback_step(step("stage_rows"))
        .with_rollback_step(step("swap_table"));
    let processor = Arc::new(
        FnProcessor::new(|_items: Vec<u32>, _index: usize| async move {
            Err::<usize, _>(anyhow::Error::new(ClassifiedError::new(
                ErrorCategory::Validation,
                "row fails schema check",
            )))
        })
        .with_recovery_plan(plan),
    );

    let report = orchestrator()
        .process("swap", (0..10).collect(), processor)
        .await
        .unwrap();

    assert_eq!(report.failed, 10);
    assert_eq!(report.recoveries[0].outcome, Ok(RecoveryOutcome::RolledBack { steps: 2 }));
    assert_eq!(*log.lock().unwrap(), vec!["swap_table", "stage_rows"]);
}
