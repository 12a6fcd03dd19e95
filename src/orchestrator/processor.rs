//! Caller-supplied batch processing.

use crate::batch::Batch;
use crate::recovery::RecoveryPlan;
use crate::Error;
use async_trait::async_trait;
use std::future::Future;

pub const DEFAULT_OPERATION_KEY: &str = "process_batch";

/// Processes one batch with a pooled resource.
///
/// Errors may carry a [`crate::classify::ClassifiedError`] to pin their category.
#[async_trait]
pub trait Processor<T, O, H>: Send + Sync {
    async fn process(&self, batch: &Batch<T>, resource: &H) -> anyhow::Result<O>;

    /// Key under which retries and the circuit breaker are tracked.
    fn operation_key(&self) -> &str {
        DEFAULT_OPERATION_KEY
    }

    /// Repair, compensation and rollback actions available for a batch that
    /// failed with `error`. Empty by default, leaving retry or skip.
    fn recovery_plan(&self, _batch: &Batch<T>, _error: &Error) -> RecoveryPlan {
        RecoveryPlan::default()
    }
}

/// Closure-backed [`Processor`] that ignores the pooled resource.
///
/// The closure receives a copy of the batch items and the batch index.
pub struct FnProcessor<F> {
    key: String,
    plan: RecoveryPlan,
    f: F,
}

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self {
            key: DEFAULT_OPERATION_KEY.to_string(),
            plan: RecoveryPlan::default(),
            f,
        }
    }

    pub fn with_operation_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Plan offered to recovery for every failed batch.
    pub fn with_recovery_plan(mut self, plan: RecoveryPlan) -> Self {
        self.plan = plan;
        self
    }
}

#[async_trait]
impl<T, O, H, F, Fut> Processor<T, O, H> for FnProcessor<F>
where
    T: Clone + Send + Sync + 'static,
    O: Send + 'static,
    H: Send + Sync + 'static,
    F: Fn(Vec<T>, usize) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<O>> + Send,
{
    async fn process(&self, batch: &Batch<T>, _resource: &H) -> anyhow::Result<O> {
        (self.f)(batch.items.clone(), batch.index).await
    }

    fn operation_key(&self) -> &str {
        &self.key
    }

    fn recovery_plan(&self, _batch: &Batch<T>, _error: &Error) -> RecoveryPlan {
        self.plan.clone()
    }
}
