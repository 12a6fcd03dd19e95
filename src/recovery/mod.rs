//! 恢复模块：对不可恢复的失败选择恢复策略，维护检查点并执行一致性检查。
//!
//! # Recovery & Consistency
//!
//! [`RecoveryManager::recover`] classifies a failure that escaped the retry
//! loop and applies exactly one strategy:
//!
//! | Priority | Strategy | When |
//! |----------|----------|------|
//! | 1 | Manual intervention | Critical severity; an escalation record is created |
//! | 2 | Automatic retry | Retryable, budget left, and a retry operation is supplied |
//! | 3 | Data repair | Validation category with a declared repair action |
//! | 4 | Compensating transaction | Orchestration category with declared compensations |
//! | 5 | Rollback | Declared rollback steps, run in reverse |
//! | 6 | Skip and continue | Everything else; optionally flagged for review |
//!
//! Manual intervention is returned as [`RecoveryOutcome::AwaitingAction`], not as
//! an error. A strategy that itself fails yields [`crate::Error::RecoveryFailed`].
//!
//! The manager also owns checkpoint persistence through a [`CheckpointStore`]
//! and runs [`consistency`] checks on demand or periodically.

pub mod checkpoint;
pub mod consistency;
mod strategies;

pub use checkpoint::{
    Checkpoint, CheckpointPolicy, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
pub use consistency::{
    BalanceGroup, ConsistencyIssue, ConsistencyReport, ConsistencyScope, ConsistencySource,
    IssueType, RecordSnapshot, ReferenceLink, StaticConsistencySource, WorkflowCounters,
};
pub use strategies::{
    CompensationAction, FnAction, RecoveryOutcome, RecoveryPlan, RecoveryStrategy, RepairAction,
    RetryOperation,
};

use crate::classify::{
    Classification, ClassifiedError, ClassifyContext, ErrorCategory, RuleBasedClassifier,
    SharedClassifier,
};
use crate::error::ErrorContext;
use crate::events::{emit, noop_sink, now_ms, RuntimeEvent, SharedEventSink};
use crate::resilience::{RetryCoordinator, RetryPolicy};
use crate::sizing::ThroughputSample;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Policy for the automatic-retry strategy.
    pub retry: RetryPolicy,
    pub max_escalations: usize,
    pub flag_skipped_for_review: bool,
    pub max_review_flags: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_escalations: 100,
            flag_skipped_for_review: true,
            max_review_flags: 1_000,
        }
    }
}

impl RecoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
    pub fn with_max_escalations(mut self, n: usize) -> Self {
        self.max_escalations = n;
        self
    }
    pub fn with_flag_skipped_for_review(mut self, on: bool) -> Self {
        self.flag_skipped_for_review = on;
        self
    }
}

/// Periodic consistency checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub required_fields: Vec<String>,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 60_000,
            required_fields: Vec::new(),
        }
    }
}

impl ConsistencyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Everything a strategy may need about the failed operation.
#[derive(Clone, Default)]
pub struct RecoveryContext {
    pub processing_id: String,
    pub operation: String,
    pub batch_index: Option<usize>,
    pub attempts_used: u32,
    pub classification: Option<Classification>,
    pub retry: Option<RetryOperation>,
    pub repair: Option<Arc<dyn RepairAction>>,
    pub compensations: Vec<Arc<dyn CompensationAction>>,
    pub rollback: Vec<Arc<dyn CompensationAction>>,
    /// Stops an automatic retry between and during attempts.
    pub cancel: Option<CancellationToken>,
    /// Upper bound on each re-invocation of the retry operation.
    pub attempt_timeout: Option<Duration>,
}

impl RecoveryContext {
    pub fn new(processing_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            processing_id: processing_id.into(),
            operation: operation.into(),
            ..Self::default()
        }
    }
    pub fn with_batch_index(mut self, index: usize) -> Self {
        self.batch_index = Some(index);
        self
    }
    pub fn with_attempts_used(mut self, n: u32) -> Self {
        self.attempts_used = n;
        self
    }
    pub fn with_classification(mut self, c: Classification) -> Self {
        self.classification = Some(c);
        self
    }
    pub fn with_retry(mut self, op: RetryOperation) -> Self {
        self.retry = Some(op);
        self
    }
    pub fn with_repair(mut self, action: Arc<dyn RepairAction>) -> Self {
        self.repair = Some(action);
        self
    }
    pub fn with_compensation(mut self, action: Arc<dyn CompensationAction>) -> Self {
        self.compensations.push(action);
        self
    }
    /// Steps are declared in forward order and undone in reverse.
    pub fn with_rollback_step(mut self, action: Arc<dyn CompensationAction>) -> Self {
        self.rollback.push(action);
        self
    }
    /// Adds the plan's actions; a declared repair replaces any earlier one.
    pub fn with_plan(mut self, plan: RecoveryPlan) -> Self {
        if plan.repair.is_some() {
            self.repair = plan.repair;
        }
        self.compensations.extend(plan.compensations);
        self.rollback.extend(plan.rollback);
        self
    }
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationRecord {
    pub id: String,
    pub processing_id: String,
    pub operation: String,
    pub batch_index: Option<usize>,
    pub reason: String,
    pub classification: Classification,
    pub attempts: u32,
    pub created_at_ms: u64,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewFlag {
    pub processing_id: String,
    pub operation: String,
    pub batch_index: Option<usize>,
    pub reason: String,
    pub flagged_at_ms: u64,
}

/// Where a resumed run picks up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub processed: usize,
    pub failed: usize,
    pub items_consumed: usize,
    pub next_batch_index: usize,
    pub recent_metrics: Vec<ThroughputSample>,
}

pub struct RecoveryManager {
    classifier: SharedClassifier,
    retry: Option<Arc<RetryCoordinator>>,
    store: Arc<dyn CheckpointStore>,
    config: RecoveryConfig,
    escalations: Mutex<VecDeque<EscalationRecord>>,
    review_flags: Mutex<VecDeque<ReviewFlag>>,
    events: SharedEventSink,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(Arc::new(RuleBasedClassifier::new()))
    }
}

impl RecoveryManager {
    pub fn new(classifier: SharedClassifier) -> Self {
        Self {
            classifier,
            retry: None,
            store: Arc::new(InMemoryCheckpointStore::new()),
            config: RecoveryConfig::default(),
            escalations: Mutex::new(VecDeque::new()),
            review_flags: Mutex::new(VecDeque::new()),
            events: noop_sink(),
        }
    }

    pub fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_coordinator(mut self, retry: Arc<RetryCoordinator>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: SharedEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Classification of a runtime error, reusing the one recorded by the retry loop.
    pub fn classify(&self, err: &Error, ctx: &RecoveryContext) -> Classification {
        if let Some(c) = &ctx.classification {
            return c.clone();
        }
        if let Error::RetryExhausted { classification, .. } = err {
            return classification.clone();
        }
        let wrapped = match err.category_hint() {
            Some(category) => anyhow::Error::new(ClassifiedError::new(category, err.to_string())),
            None => anyhow::anyhow!(err.to_string()),
        };
        let mut cctx = ClassifyContext::new(ctx.operation.clone()).with_attempt(ctx.attempts_used);
        cctx.batch_index = ctx.batch_index;
        self.classifier.classify(&wrapped, &cctx)
    }

    /// Strategy the manager would pick for this classification and context.
    pub fn select_strategy(&self, c: &Classification, ctx: &RecoveryContext) -> RecoveryStrategy {
        let retries_used = ctx.attempts_used.saturating_sub(1);
        if c.is_critical() {
            RecoveryStrategy::ManualIntervention
        } else if c.retryable
            && retries_used < c.max_retries
            && ctx.retry.is_some()
            && self.retry.is_some()
        {
            RecoveryStrategy::AutomaticRetry
        } else if c.category == ErrorCategory::Validation && ctx.repair.is_some() {
            RecoveryStrategy::DataRepair
        } else if c.category == ErrorCategory::Orchestration && !ctx.compensations.is_empty() {
            RecoveryStrategy::CompensatingTransaction
        } else if !ctx.rollback.is_empty() {
            RecoveryStrategy::Rollback
        } else {
            RecoveryStrategy::SkipAndContinue
        }
    }

    /// Apply exactly one recovery strategy to `err`.
    pub async fn recover(&self, err: &Error, ctx: RecoveryContext) -> Result<RecoveryOutcome> {
        let classification = self.classify(err, &ctx);
        let strategy = self.select_strategy(&classification, &ctx);
        info!(
            processing_id = %ctx.processing_id,
            operation = %ctx.operation,
            batch_index = ?ctx.batch_index,
            category = %classification.category,
            strategy = strategy.as_str(),
            "applying recovery strategy"
        );

        let result = match strategy {
            RecoveryStrategy::ManualIntervention => Ok(self.escalate(err, &ctx, classification).await),
            RecoveryStrategy::AutomaticRetry => self.retry_operation(&ctx).await,
            RecoveryStrategy::DataRepair => self.repair(&ctx).await,
            RecoveryStrategy::CompensatingTransaction => {
                run_actions(strategy, ctx.compensations.iter())
                    .await
                    .map(|actions| RecoveryOutcome::Compensated { actions })
            }
            RecoveryStrategy::Rollback => run_actions(strategy, ctx.rollback.iter().rev())
                .await
                .map(|steps| RecoveryOutcome::RolledBack { steps }),
            RecoveryStrategy::SkipAndContinue => Ok(self.skip(err, &ctx)),
        };

        let outcome_label = match &result {
            Ok(outcome) => outcome.label().to_string(),
            Err(e) => {
                error!(strategy = strategy.as_str(), error = %e, "recovery strategy failed");
                format!("failed: {}", e)
            }
        };
        emit(
            &self.events,
            RuntimeEvent::RecoveryApplied {
                processing_id: ctx.processing_id.clone(),
                batch_index: ctx.batch_index,
                strategy: strategy.as_str().to_string(),
                outcome: outcome_label,
            },
        )
        .await;
        result
    }

    async fn retry_operation(&self, ctx: &RecoveryContext) -> Result<RecoveryOutcome> {
        let (Some(coordinator), Some(op)) = (self.retry.as_ref(), ctx.retry.as_ref()) else {
            return Err(recovery_failed(
                RecoveryStrategy::AutomaticRetry,
                "no retry operation available",
            ));
        };
        let mut policy = self.config.retry.clone();
        if let Some(limit) = ctx.attempt_timeout {
            let ms = limit.as_millis() as u64;
            policy.attempt_timeout_ms = Some(policy.attempt_timeout_ms.map_or(ms, |own| own.min(ms)));
        }
        let cancel = ctx.cancel.clone().unwrap_or_default();
        let calls = std::sync::atomic::AtomicU32::new(0);
        coordinator
            .execute_with_cancel(
                &ctx.operation,
                || {
                    calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    op()
                },
                &policy,
                &cancel,
                ctx.batch_index,
            )
            .await
            .map(|()| RecoveryOutcome::Retried {
                attempts: calls.load(std::sync::atomic::Ordering::Relaxed),
            })
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                e => recovery_failed(RecoveryStrategy::AutomaticRetry, e),
            })
    }

    async fn repair(&self, ctx: &RecoveryContext) -> Result<RecoveryOutcome> {
        let Some(action) = ctx.repair.as_ref() else {
            return Err(recovery_failed(RecoveryStrategy::DataRepair, "no repair action declared"));
        };
        let detected = action
            .detect()
            .await
            .map_err(|e| recovery_failed(RecoveryStrategy::DataRepair, format!("{}: {:#}", action.name(), e)))?;
        if detected == 0 {
            return Ok(RecoveryOutcome::Repaired {
                detected: 0,
                repaired: 0,
            });
        }
        let repaired = action
            .repair()
            .await
            .map_err(|e| recovery_failed(RecoveryStrategy::DataRepair, format!("{}: {:#}", action.name(), e)))?;
        info!(action = action.name(), detected, repaired, "data repair applied");
        Ok(RecoveryOutcome::Repaired { detected, repaired })
    }

    async fn escalate(&self, err: &Error, ctx: &RecoveryContext, classification: Classification) -> RecoveryOutcome {
        let record = EscalationRecord {
            id: Uuid::new_v4().to_string(),
            processing_id: ctx.processing_id.clone(),
            operation: ctx.operation.clone(),
            batch_index: ctx.batch_index,
            reason: err.to_string(),
            classification,
            attempts: err.attempts().max(ctx.attempts_used),
            created_at_ms: now_ms(),
            resolved: false,
        };
        let id = record.id.clone();
        warn!(escalation_id = %id, reason = %record.reason, "manual intervention required");
        {
            let mut list = self.escalations.lock().unwrap_or_else(|p| p.into_inner());
            list.push_back(record.clone());
            while list.len() > self.config.max_escalations.max(1) {
                list.pop_front();
            }
        }
        emit(
            &self.events,
            RuntimeEvent::EscalationCreated {
                escalation_id: id.clone(),
                reason: record.reason,
            },
        )
        .await;
        RecoveryOutcome::AwaitingAction { escalation_id: id }
    }

    fn skip(&self, err: &Error, ctx: &RecoveryContext) -> RecoveryOutcome {
        let flag = self.config.flag_skipped_for_review;
        if flag {
            let mut flags = self.review_flags.lock().unwrap_or_else(|p| p.into_inner());
            flags.push_back(ReviewFlag {
                processing_id: ctx.processing_id.clone(),
                operation: ctx.operation.clone(),
                batch_index: ctx.batch_index,
                reason: err.to_string(),
                flagged_at_ms: now_ms(),
            });
            while flags.len() > self.config.max_review_flags.max(1) {
                flags.pop_front();
            }
        }
        RecoveryOutcome::Skipped {
            flagged_for_review: flag,
        }
    }

    pub fn pending_escalations(&self) -> Vec<EscalationRecord> {
        self.escalations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| !e.resolved)
            .cloned()
            .collect()
    }

    /// Mark an escalation handled; `false` if it is unknown.
    pub fn resolve_escalation(&self, id: &str) -> bool {
        let mut list = self.escalations.lock().unwrap_or_else(|p| p.into_inner());
        match list.iter_mut().find(|e| e.id == id) {
            Some(e) => {
                e.resolved = true;
                true
            }
            None => false,
        }
    }

    pub fn review_flags(&self) -> Vec<ReviewFlag> {
        self.review_flags
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Run the consistency battery and report every issue found.
    pub async fn check_consistency(
        &self,
        source: &dyn ConsistencySource,
        scope: &ConsistencyScope,
    ) -> ConsistencyReport {
        let report = consistency::run_checks(source, scope).await;
        for e in &report.source_errors {
            warn!(scope = %scope.name, error = %e, "consistency check could not run");
        }
        for issue in &report.issues {
            warn!(
                scope = %scope.name,
                issue_type = %issue.issue_type,
                affected = issue.affected_count,
                "{}",
                issue.description
            );
            emit(
                &self.events,
                RuntimeEvent::ConsistencyIssueFound {
                    issue: issue.clone(),
                },
            )
            .await;
        }
        report
    }

    /// Check `processed + failed == total` for one run and report a mismatch.
    pub async fn check_workflow_counts(
        &self,
        processing_id: &str,
        processed: usize,
        failed: usize,
        total: usize,
    ) -> Option<ConsistencyIssue> {
        let issue = consistency::check_workflow(&WorkflowCounters {
            workflow_id: processing_id.to_string(),
            processed,
            failed,
            total,
        })?;
        warn!(processing_id, "{}", issue.description);
        emit(
            &self.events,
            RuntimeEvent::ConsistencyIssueFound {
                issue: issue.clone(),
            },
        )
        .await;
        Some(issue)
    }

    /// Run [`RecoveryManager::check_consistency`] every `every` until cancelled.
    pub fn spawn_periodic_checks(
        self: &Arc<Self>,
        source: Arc<dyn ConsistencySource>,
        scope: ConsistencyScope,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.check_consistency(source.as_ref(), &scope).await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    pub async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.store
            .save(&checkpoint.processing_id, checkpoint)
            .await?;
        info!(
            processing_id = %checkpoint.processing_id,
            processed = checkpoint.processed_count,
            failed = checkpoint.failed_count,
            items_consumed = checkpoint.items_consumed,
            "checkpoint saved"
        );
        emit(
            &self.events,
            RuntimeEvent::CheckpointSaved {
                processing_id: checkpoint.processing_id.clone(),
                processed: checkpoint.processed_count,
                failed: checkpoint.failed_count,
                last_batch_index: checkpoint.last_batch_index,
            },
        )
        .await;
        Ok(())
    }

    /// Load the checkpoint for `processing_id`, if any, and check it belongs to
    /// an item list of `total_items`.
    pub async fn resume_from_checkpoint(
        &self,
        processing_id: &str,
        total_items: usize,
    ) -> Result<Option<ResumePoint>> {
        let Some(cp) = self.store.load(processing_id).await? else {
            return Ok(None);
        };
        if cp.total_count != total_items || cp.items_consumed > total_items {
            return Err(Error::validation_with_context(
                "checkpoint does not match the item list",
                ErrorContext::new()
                    .with_field_path("checkpoint.total_count")
                    .with_details(format!(
                        "checkpoint total {} / consumed {}, items {}",
                        cp.total_count, cp.items_consumed, total_items
                    ))
                    .with_source("recovery_manager"),
            ));
        }
        if cp.processed_count + cp.failed_count > cp.items_consumed {
            return Err(Error::validation_with_context(
                "checkpoint counters exceed consumed items",
                ErrorContext::new().with_source("recovery_manager"),
            ));
        }
        info!(
            processing_id,
            items_consumed = cp.items_consumed,
            processed = cp.processed_count,
            failed = cp.failed_count,
            "resuming from checkpoint"
        );
        Ok(Some(ResumePoint {
            processed: cp.processed_count,
            failed: cp.failed_count,
            items_consumed: cp.items_consumed,
            next_batch_index: cp.next_batch_index(),
            recent_metrics: cp.recent_metrics,
        }))
    }

    pub async fn clear_checkpoint(&self, processing_id: &str) -> Result<()> {
        self.store.delete(processing_id).await
    }
}

fn recovery_failed(strategy: RecoveryStrategy, message: impl std::fmt::Display) -> Error {
    Error::RecoveryFailed {
        strategy: strategy.as_str().to_string(),
        message: message.to_string(),
    }
}

/// Run actions in the given order, stopping at the first failure.
async fn run_actions<'a>(
    strategy: RecoveryStrategy,
    actions: impl Iterator<Item = &'a Arc<dyn CompensationAction>>,
) -> Result<usize> {
    let mut done = 0;
    for action in actions {
        if let Err(e) = action.execute().await {
            return Err(recovery_failed(
                strategy,
                format!(
                    "action '{}' failed after {} completed: {:#}",
                    action.name(),
                    done,
                    e
                ),
            ));
        }
        done += 1;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Severity;
    use crate::events::InMemoryEventSink;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn action(name: &str, log: Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<dyn CompensationAction> {
        let name = name.to_string();
        Arc::new(FnAction::new(name.clone(), move || {
            let log = log.clone();
            let name = name.clone();
            async move {
                if fail {
                    anyhow::bail!("{} exploded", name);
                }
                log.lock().unwrap().push(name);
                Ok(())
            }
        }))
    }

    fn classified(category: ErrorCategory, severity: Severity) -> Classification {
        Classification::new(category).with_severity(severity)
    }

    #[tokio::test]
    async fn test_critical_failure_escalates_without_error() {
        let events = Arc::new(InMemoryEventSink::new(16));
        let mgr = RecoveryManager::default().with_events(events.clone());
        let ctx = RecoveryContext::new("run", "post_journal")
            .with_classification(classified(ErrorCategory::Database, Severity::Critical));
        let outcome = mgr.recover(&Error::Cancelled, ctx).await.unwrap();
        let RecoveryOutcome::AwaitingAction { escalation_id } = outcome else {
            panic!("expected escalation, got {:?}", outcome);
        };
        assert_eq!(mgr.pending_escalations().len(), 1);
        assert!(mgr.resolve_escalation(&escalation_id));
        assert!(mgr.pending_escalations().is_empty());
        assert!(!mgr.resolve_escalation("nope"));
        assert_eq!(events.count_of("escalation_created"), 1);
        assert_eq!(events.count_of("recovery_applied"), 1);
    }

    #[tokio::test]
    async fn test_automatic_retry_reinvokes_operation() {
        let coordinator = Arc::new(RetryCoordinator::default());
        let mgr = RecoveryManager::default()
            .with_retry_coordinator(coordinator)
            .with_config(RecoveryConfig::new().with_retry(
                RetryPolicy::new()
                    .with_base_delay(Duration::from_millis(1))
                    .with_jitter(0.0),
            ));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let op: RetryOperation = Arc::new(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        let ctx = RecoveryContext::new("run", "load")
            .with_classification(Classification::new(ErrorCategory::Network).retryable(3))
            .with_retry(op);
        let outcome = mgr
            .recover(&Error::ResourceTimeout { waited_ms: 5 }, ctx)
            .await
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Retried { attempts: 1 });
        assert!(outcome.work_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn hung_operation() -> RetryOperation {
        Arc::new(|| {
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        })
    }

    fn quick_retry_manager() -> RecoveryManager {
        RecoveryManager::default()
            .with_retry_coordinator(Arc::new(RetryCoordinator::default()))
            .with_config(RecoveryConfig::new().with_retry(
                RetryPolicy::new()
                    .with_max_retries(2)
                    .with_base_delay(Duration::from_millis(1))
                    .with_jitter(0.0),
            ))
    }

    #[tokio::test]
    async fn test_automatic_retry_bounds_each_attempt() {
        let mgr = quick_retry_manager();
        let ctx = RecoveryContext::new("run", "export")
            .with_classification(Classification::new(ErrorCategory::Timeout).retryable(3))
            .with_retry(hung_operation())
            .with_attempt_timeout(Duration::from_millis(20));
        let started = std::time::Instant::now();
        let err = mgr
            .recover(&Error::Timeout { elapsed_ms: 20 }, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecoveryFailed { .. }), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_automatic_retry_stops_on_cancellation() {
        let mgr = quick_retry_manager();
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.cancel();
        });
        let ctx = RecoveryContext::new("run", "export")
            .with_classification(Classification::new(ErrorCategory::Network).retryable(3))
            .with_retry(Arc::new(|| async { Err::<(), _>(anyhow::anyhow!("connection reset")) }.boxed()))
            .with_cancellation(token);
        let mgr = mgr.with_config(RecoveryConfig::new().with_retry(
            RetryPolicy::new()
                .with_max_retries(3)
                .with_base_delay(Duration::from_secs(30))
                .with_jitter(0.0),
        ));
        let started = std::time::Instant::now();
        let err = mgr
            .recover(&Error::Timeout { elapsed_ms: 1 }, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    struct CountingRepair {
        repaired: AtomicUsize,
    }

    #[async_trait]
    impl RepairAction for CountingRepair {
        fn name(&self) -> &str {
            "null_gl_accounts"
        }
        async fn detect(&self) -> anyhow::Result<usize> {
            Ok(3)
        }
        async fn repair(&self) -> anyhow::Result<usize> {
            self.repaired.fetch_add(3, Ordering::SeqCst);
            Ok(3)
        }
    }

    #[tokio::test]
    async fn test_validation_error_is_repaired() {
        let mgr = RecoveryManager::default();
        let repair = Arc::new(CountingRepair {
            repaired: AtomicUsize::new(0),
        });
        let ctx = RecoveryContext::new("run", "write").with_repair(repair.clone());
        let err = Error::validation_with_context("bad row", ErrorContext::new());
        let outcome = mgr.recover(&err, ctx).await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Repaired {
                detected: 3,
                repaired: 3
            }
        );
        assert_eq!(repair.repaired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_compensation_stops_at_first_failure() {
        let mgr = RecoveryManager::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let ctx = RecoveryContext::new("run", "classify")
            .with_classification(classified(ErrorCategory::Orchestration, Severity::High))
            .with_compensation(action("delete_rows", log.clone(), false))
            .with_compensation(action("reset_state", log.clone(), true))
            .with_compensation(action("notify", log.clone(), false));
        let err = mgr.recover(&Error::Cancelled, ctx).await.unwrap_err();
        assert!(matches!(err, Error::RecoveryFailed { ref strategy, .. } if strategy == "compensating_transaction"));
        assert_eq!(*log.lock().unwrap(), vec!["delete_rows".to_string()]);
    }

    #[tokio::test]
    async fn test_rollback_runs_in_reverse() {
        let mgr = RecoveryManager::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let ctx = RecoveryContext::new("run", "import")
            .with_classification(classified(ErrorCategory::Database, Severity::High))
            .with_rollback_step(action("step1", log.clone(), false))
            .with_rollback_step(action("step2", log.clone(), false));
        let outcome = mgr.recover(&Error::Cancelled, ctx).await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::RolledBack { steps: 2 });
        assert_eq!(*log.lock().unwrap(), vec!["step2".to_string(), "step1".to_string()]);
    }

    #[tokio::test]
    async fn test_default_is_skip_and_flag() {
        let mgr = RecoveryManager::default();
        let ctx = RecoveryContext::new("run", "x").with_batch_index(7);
        let outcome = mgr
            .recover(&Error::runtime("unexpected"), ctx)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Skipped {
                flagged_for_review: true
            }
        );
        assert_eq!(mgr.review_flags()[0].batch_index, Some(7));
    }

    #[tokio::test]
    async fn test_resume_rejects_foreign_checkpoint() {
        let mgr = RecoveryManager::default();
        let mut cp = Checkpoint::new("run", 100);
        cp.items_consumed = 40;
        cp.processed_count = 40;
        mgr.create_checkpoint(&cp).await.unwrap();
        assert!(mgr.resume_from_checkpoint("run", 99).await.is_err());
        let point = mgr.resume_from_checkpoint("run", 100).await.unwrap().unwrap();
        assert_eq!(point.items_consumed, 40);
        assert!(mgr.resume_from_checkpoint("other", 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_periodic_checks_emit_issues() {
        let events = Arc::new(InMemoryEventSink::new(64));
        let mgr = Arc::new(RecoveryManager::default().with_events(events.clone()));
        let source = Arc::new(StaticConsistencySource {
            workflows: vec![WorkflowCounters {
                workflow_id: "w".into(),
                processed: 1,
                failed: 0,
                total: 2,
            }],
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let handle = mgr.spawn_periodic_checks(
            source,
            ConsistencyScope::new("periodic"),
            Duration::from_millis(10),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(events.count_of("consistency_issue_found") >= 2);
    }
}
