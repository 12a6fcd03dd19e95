//! Recovery strategies and the actions they run.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    AutomaticRetry,
    DataRepair,
    CompensatingTransaction,
    Rollback,
    ManualIntervention,
    SkipAndContinue,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::AutomaticRetry => "automatic_retry",
            RecoveryStrategy::DataRepair => "data_repair",
            RecoveryStrategy::CompensatingTransaction => "compensating_transaction",
            RecoveryStrategy::Rollback => "rollback",
            RecoveryStrategy::ManualIntervention => "manual_intervention",
            RecoveryStrategy::SkipAndContinue => "skip_and_continue",
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful recovery did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The original operation succeeded on re-invocation.
    Retried { attempts: u32 },
    Repaired { detected: usize, repaired: usize },
    Compensated { actions: usize },
    RolledBack { steps: usize },
    /// Escalated; nothing proceeds until someone resolves the escalation.
    AwaitingAction { escalation_id: String },
    Skipped { flagged_for_review: bool },
}

impl RecoveryOutcome {
    pub fn strategy(&self) -> RecoveryStrategy {
        match self {
            RecoveryOutcome::Retried { .. } => RecoveryStrategy::AutomaticRetry,
            RecoveryOutcome::Repaired { .. } => RecoveryStrategy::DataRepair,
            RecoveryOutcome::Compensated { .. } => RecoveryStrategy::CompensatingTransaction,
            RecoveryOutcome::RolledBack { .. } => RecoveryStrategy::Rollback,
            RecoveryOutcome::AwaitingAction { .. } => RecoveryStrategy::ManualIntervention,
            RecoveryOutcome::Skipped { .. } => RecoveryStrategy::SkipAndContinue,
        }
    }

    /// Whether the failed work itself ended up done.
    pub fn work_completed(&self) -> bool {
        matches!(self, RecoveryOutcome::Retried { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecoveryOutcome::Retried { .. } => "retried",
            RecoveryOutcome::Repaired { .. } => "repaired",
            RecoveryOutcome::Compensated { .. } => "compensated",
            RecoveryOutcome::RolledBack { .. } => "rolled_back",
            RecoveryOutcome::AwaitingAction { .. } => "awaiting_action",
            RecoveryOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Re-invocable operation used by automatic retry.
pub type RetryOperation = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Detects and fixes malformed persisted records.
#[async_trait]
pub trait RepairAction: Send + Sync {
    fn name(&self) -> &str;

    /// Number of malformed records currently present.
    async fn detect(&self) -> anyhow::Result<usize>;

    /// Apply the repair; returns how many records were changed.
    async fn repair(&self) -> anyhow::Result<usize>;
}

/// One inverse step of a multi-step operation (compensation or rollback).
#[async_trait]
pub trait CompensationAction: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self) -> anyhow::Result<()>;
}

/// Closure-backed [`CompensationAction`].
pub struct FnAction<F> {
    name: String,
    f: F,
}

impl<F> FnAction<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> CompensationAction for FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> anyhow::Result<()> {
        (self.f)().await
    }
}

/// Recovery actions declared for one failed unit of work.
///
/// Attached to a [`super::RecoveryContext`] with `with_plan`; the manager
/// still picks at most one strategy.
#[derive(Clone, Default)]
pub struct RecoveryPlan {
    pub repair: Option<Arc<dyn RepairAction>>,
    pub compensations: Vec<Arc<dyn CompensationAction>>,
    pub rollback: Vec<Arc<dyn CompensationAction>>,
}

impl RecoveryPlan {
    pub fn new() -> Self {
        Self::default()
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

    pub fn is_empty(&self) -> bool {
        self.repair.is_none() && self.compensations.is_empty() && self.rollback.is_empty()
    }
}
