//! 编排模块：组合批次切分、资源池、重试、并行执行与恢复，完成一次可断点续跑的批处理运行。
//!
//! # Batch Orchestrator
//!
//! [`BatchOrchestrator::process`] drives one item list through the runtime:
//!
//! 1. Load the run's checkpoint, if any, and skip the items it already covers.
//! 2. Cut a wave of up to `concurrency` batches sized by the [`BatchSizer`]
//!    from recent throughput and the current load signal.
//! 3. Run the wave on the [`ParallelExecutionEngine`]. Each batch checks a
//!    resource out of the [`ConnectionPool`] and calls the [`Processor`]
//!    through the [`RetryCoordinator`].
//! 4. Hand batches that still failed to the [`RecoveryManager`]. Batches that
//!    stay failed are dead-lettered for later reprocessing.
//! 5. Record throughput samples and checkpoint the finished prefix.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchOrchestrator`] | Owns every component of a run |
//! | [`BatchOrchestratorBuilder`] | Builds one from a [`RuntimeConfig`] |
//! | [`Processor`] / [`FnProcessor`] | Caller batch logic |
//! | [`RunReport`] | Counters, per-batch results, recoveries, consistency issues |
//! | [`FailedBatchRef`] | Dead-letter payload pointing back into the item list |
//!
//! A finished run always satisfies `processed + failed == total`, including
//! runs that resumed from a checkpoint; a mismatch is reported as a
//! consistency issue rather than corrected.

mod builder;
mod processor;
mod report;

pub use builder::BatchOrchestratorBuilder;
pub use processor::{FnProcessor, Processor, DEFAULT_OPERATION_KEY};
pub use report::{BatchRecovery, FailedBatchRef, RunReport};

use crate::batch::{next_batch_size, Batch, BatchOutcome, BatchResult};
use crate::config::RuntimeConfig;
use crate::error::ErrorContext;
use crate::events::{emit, RuntimeEvent, SharedEventSink};
use crate::execution::{into_batch_error, ExecutionOptions, ParallelExecutionEngine};
use crate::pool::{ConnectionPool, ResourceFactory};
use crate::recovery::{
    Checkpoint, ConsistencyScope, ConsistencySource, RecoveryContext, RecoveryManager,
    ResumePoint, RetryOperation,
};
use crate::resilience::{DeadLetterEntry, DeadLetterQueue, RetryCoordinator, RetryPolicy};
use crate::sizing::{BatchSizer, LoadProbe, LoadSignal, ThroughputSample};
use crate::{Error, Result};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BatchOrchestrator<F: ResourceFactory> {
    config: RuntimeConfig,
    sizer: Arc<BatchSizer>,
    pool: ConnectionPool<F>,
    retry: Arc<RetryCoordinator>,
    recovery: Arc<RecoveryManager>,
    dead_letters: Arc<DeadLetterQueue<FailedBatchRef>>,
    load_probe: Option<Arc<dyn LoadProbe>>,
    consistency_source: Option<Arc<dyn ConsistencySource>>,
    events: SharedEventSink,
    cancel: CancellationToken,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: ResourceFactory> BatchOrchestrator<F> {
    pub fn builder(factory: F) -> BatchOrchestratorBuilder<F> {
        BatchOrchestratorBuilder::new(factory)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn sizer(&self) -> &Arc<BatchSizer> {
        &self.sizer
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    pub fn retry_coordinator(&self) -> &Arc<RetryCoordinator> {
        &self.retry
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue<FailedBatchRef>> {
        &self.dead_letters
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop dispatching new batches. In-flight batches finish or time out.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fill the pool up to `min_connections` and start the background health
    /// sweeper (plus periodic consistency checks when enabled).
    ///
    /// Returns how many resources were created.
    pub async fn start(&self) -> usize {
        let missing = self
            .config
            .pool
            .min_connections
            .saturating_sub(self.pool.stats().total());
        let warmed = self.pool.pre_warm(missing).await;

        let mut tasks = vec![self.pool.spawn_health_sweeper(self.background.child_token())];
        if self.config.consistency.enabled {
            match &self.consistency_source {
                Some(source) => {
                    let scope = ConsistencyScope::new("periodic")
                        .with_required_fields(self.config.consistency.required_fields.clone());
                    tasks.push(self.recovery.spawn_periodic_checks(
                        source.clone(),
                        scope,
                        self.config.consistency.interval(),
                        self.background.child_token(),
                    ));
                }
                None => warn!("consistency checks enabled but no source configured"),
            }
        }
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(tasks);
        info!(warmed, "orchestrator started");
        warmed
    }

    /// Stop background tasks and close the pool.
    pub async fn shutdown(&self) {
        self.background.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.pool.close().await;
        info!("orchestrator shut down");
    }

    /// Process `items` under `processing_id`, resuming from its checkpoint when one exists.
    ///
    /// Batch failures never fail the call; they show up in the report. The
    /// call itself fails only when the checkpoint cannot be loaded or does not
    /// belong to this item list.
    pub async fn process<T, O, P>(
        &self,
        processing_id: &str,
        items: Vec<T>,
        processor: Arc<P>,
    ) -> Result<RunReport<O>>
    where
        T: Send + Sync + 'static,
        O: Send + 'static,
        P: Processor<T, O, F::Handle> + 'static,
    {
        let started = Instant::now();
        let total = items.len();
        let resume = self
            .recovery
            .resume_from_checkpoint(processing_id, total)
            .await?;
        let mut progress = match &resume {
            Some(point) => {
                self.sizer.restore_history(&point.recent_metrics);
                Progress::resumed(point)
            }
            None => Progress::default(),
        };
        let resumed_from = resume.as_ref().map(|p| p.items_consumed);

        info!(processing_id, total, resumed_from = ?resumed_from, "run started");
        emit(
            &self.events,
            RuntimeEvent::RunStarted {
                processing_id: processing_id.to_string(),
                total_items: total,
                resumed_at_item: resumed_from,
            },
        )
        .await;

        let unit = Arc::new(self.unit(processor));
        let engine = ParallelExecutionEngine::new(
            ExecutionOptions::from(&self.config.execution).with_cancel(self.cancel.clone()),
        );
        let width = self.config.execution.concurrency.max(1);
        let (min, max) = (
            self.config.sizing.min_batch_size,
            self.config.sizing.max_batch_size,
        );

        let mut offset = progress.items_consumed;
        let mut remaining = total.saturating_sub(offset);
        let mut pending = items.into_iter().skip(offset);
        let mut results = Vec::new();
        let mut recoveries = Vec::new();
        let mut last_saved: Option<Instant> = None;
        let mut stopped_on_failure = false;

        while remaining > 0 && !progress.broken && !self.cancel.is_cancelled() {
            let target = self.sizer.next_size(&self.load_signal());
            let mut wave = Vec::with_capacity(width);
            let mut offsets = Vec::with_capacity(width);
            while wave.len() < width && remaining > 0 {
                let take = next_batch_size(remaining, target, min, max);
                let chunk: Vec<T> = pending.by_ref().take(take).collect();
                remaining -= chunk.len();
                offsets.push(offset);
                offset += chunk.len();
                wave.push(Batch::new(progress.next_index, chunk));
                progress.next_index += 1;
            }
            debug!(processing_id, target, batches = wave.len(), "dispatching wave");

            let runner = unit.clone();
            let outcomes = engine
                .run(wave, move |batch: Batch<T>| {
                    let unit = runner.clone();
                    async move {
                        let batch = unit.park(batch);
                        unit.run::<O>(&batch).await
                    }
                })
                .await;

            let mut wave_failed = false;
            for (result, item_offset) in outcomes.into_iter().zip(offsets) {
                let parked = unit.unpark(result.index);
                let (result, settled) = self
                    .settle(processing_id, &unit, result, parked, item_offset, &mut recoveries)
                    .await;
                progress.apply(&result, settled);
                wave_failed |= settled == Settled::Failed;
                results.push(result);
            }

            self.maybe_checkpoint(processing_id, total, &mut progress, wave_failed, &mut last_saved)
                .await;
            if wave_failed && self.config.execution.fail_fast {
                warn!(processing_id, "stopping dispatch after failed wave");
                stopped_on_failure = true;
                break;
            }
        }

        let complete = progress.items_consumed == total;
        if self.config.checkpoint.enabled {
            if complete && self.config.checkpoint.delete_on_completion {
                if let Err(e) = self.recovery.clear_checkpoint(processing_id).await {
                    warn!(processing_id, error = %e, "could not delete checkpoint");
                }
            } else if progress.finished_since_save > 0 {
                self.save_checkpoint(processing_id, total, &mut progress).await;
            }
        }

        let mut consistency_issues = Vec::new();
        if complete {
            if let Some(issue) = self
                .recovery
                .check_workflow_counts(processing_id, progress.processed, progress.failed, total)
                .await
            {
                consistency_issues.push(issue);
            }
        }

        let cancelled = self.cancel.is_cancelled() && !complete;
        let elapsed = started.elapsed();
        info!(
            processing_id,
            processed = progress.processed,
            failed = progress.failed,
            total,
            cancelled,
            elapsed_ms = elapsed.as_millis() as u64,
            "run finished"
        );
        emit(
            &self.events,
            RuntimeEvent::RunFinished {
                processing_id: processing_id.to_string(),
                processed: progress.processed,
                failed: progress.failed,
                total,
                elapsed_ms: elapsed.as_millis() as u64,
                cancelled,
            },
        )
        .await;

        Ok(RunReport {
            processing_id: processing_id.to_string(),
            total,
            processed: progress.processed,
            failed: progress.failed,
            items_consumed: progress.items_consumed,
            resumed_from,
            results,
            recoveries,
            consistency_issues,
            cancelled,
            stopped_on_failure,
            elapsed,
        })
    }

    /// Re-run the dead-lettered batches of `processing_id` against the same item list.
    ///
    /// Batches that fail again go back into the queue. Run counters and
    /// checkpoints are left alone.
    pub async fn reprocess_dead_letters<T, O, P>(
        &self,
        processing_id: &str,
        items: &[T],
        processor: Arc<P>,
    ) -> Result<Vec<BatchResult<O>>>
    where
        T: Clone + Send + Sync + 'static,
        O: Send + 'static,
        P: Processor<T, O, F::Handle> + 'static,
    {
        let (mine, others): (Vec<_>, Vec<_>) = self
            .dead_letters
            .drain()
            .into_iter()
            .partition(|e| e.payload.processing_id == processing_id);
        for entry in others {
            self.dead_letters.push(entry);
        }
        if let Some(bad) = mine
            .iter()
            .find(|e| e.payload.item_offset + e.payload.item_count > items.len())
        {
            let details = format!(
                "batch {} covers items {}..{}, list has {}",
                bad.payload.batch_index,
                bad.payload.item_offset,
                bad.payload.item_offset + bad.payload.item_count,
                items.len()
            );
            for entry in mine {
                self.dead_letters.push(entry);
            }
            return Err(Error::validation_with_context(
                "dead-lettered batch lies outside the item list",
                ErrorContext::new()
                    .with_details(details)
                    .with_source("batch_orchestrator"),
            ));
        }

        let unit = self.unit(processor);
        let mut results = Vec::with_capacity(mine.len());
        for entry in mine {
            let r = entry.payload.clone();
            let slice = &items[r.item_offset..r.item_offset + r.item_count];
            let batch = Batch::new(r.batch_index, slice.to_vec());
            let started = Instant::now();
            match unit.run::<O>(&batch).await {
                Ok(out) => {
                    info!(processing_id, batch_index = batch.index, "dead-lettered batch reprocessed");
                    results.push(BatchResult::succeeded(
                        batch.id.clone(),
                        batch.index,
                        batch.len(),
                        out,
                        started.elapsed(),
                    ));
                }
                Err(e) => {
                    let err = into_batch_error(&batch.id, batch.index, e);
                    warn!(processing_id, batch_index = batch.index, error = %err, "reprocessing failed again");
                    self.dead_letters.push(
                        DeadLetterEntry::from_error(entry.operation.clone(), r, &err)
                            .with_batch_index(batch.index),
                    );
                    results.push(BatchResult::failed(
                        batch.id.clone(),
                        batch.index,
                        batch.len(),
                        err,
                        started.elapsed(),
                    ));
                }
            }
        }
        Ok(results)
    }

    fn unit<T, P>(&self, processor: Arc<P>) -> Unit<F, T, P> {
        Unit {
            pool: self.pool.clone(),
            retry: self.retry.clone(),
            processor,
            policy: self.config.retry.clone(),
            cancel: self.cancel.clone(),
            batch_timeout: self.config.execution.batch_timeout_ms.map(Duration::from_millis),
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Probe reading, with the queue component raised to the pool's own load.
    fn load_signal(&self) -> LoadSignal {
        let probe = self
            .load_probe
            .as_ref()
            .map(|p| p.sample())
            .unwrap_or_default();
        let queue = probe.queue.max(self.pool.stats().load());
        LoadSignal::new(probe.cpu, probe.memory, queue)
    }

    /// Turn one engine result into its final form, running recovery on failures.
    async fn settle<T, O, P>(
        &self,
        processing_id: &str,
        unit: &Arc<Unit<F, T, P>>,
        result: BatchResult<O>,
        parked: Option<Arc<Batch<T>>>,
        item_offset: usize,
        recoveries: &mut Vec<BatchRecovery>,
    ) -> (BatchResult<O>, Settled)
    where
        T: Send + Sync + 'static,
        O: Send + 'static,
        P: Processor<T, O, F::Handle> + 'static,
    {
        let BatchResult {
            batch_id,
            index,
            item_count,
            outcome,
            elapsed,
        } = result;
        let err = match outcome {
            BatchOutcome::Succeeded(out) => {
                self.record_success(processing_id, index, item_count, elapsed)
                    .await;
                let result = BatchResult::succeeded(batch_id, index, item_count, out, elapsed);
                return (result, Settled::Processed);
            }
            BatchOutcome::NotDispatched => {
                let result = BatchResult::not_dispatched(batch_id, index, item_count);
                return (result, Settled::Unfinished);
            }
            BatchOutcome::Failed(Error::Cancelled) => {
                let result = BatchResult::failed(batch_id, index, item_count, Error::Cancelled, elapsed);
                return (result, Settled::Unfinished);
            }
            BatchOutcome::Failed(err) => err,
        };

        let operation = unit.processor.operation_key().to_string();
        let slot: Arc<Mutex<Option<O>>> = Arc::new(Mutex::new(None));
        let mut ctx = RecoveryContext::new(processing_id, operation.clone())
            .with_batch_index(index)
            .with_attempts_used(err.attempts())
            .with_cancellation(self.cancel.clone());
        if let Some(limit) = unit.batch_timeout {
            ctx = ctx.with_attempt_timeout(limit);
        }
        if let Some(batch) = parked {
            ctx = ctx
                .with_plan(unit.processor.recovery_plan(&batch, &err))
                .with_retry(retry_operation(unit.clone(), batch, slot.clone()));
        }
        let recovered = self.recovery.recover(&err, ctx).await;
        let output = slot.lock().unwrap_or_else(|p| p.into_inner()).take();

        match (recovered, output) {
            (Err(Error::Cancelled), _) => {
                let result = BatchResult::failed(batch_id, index, item_count, Error::Cancelled, elapsed);
                (result, Settled::Unfinished)
            }
            (Ok(outcome), Some(out)) if outcome.work_completed() => {
                recoveries.push(BatchRecovery {
                    batch_index: index,
                    outcome: Ok(outcome),
                });
                self.record_success(processing_id, index, item_count, elapsed)
                    .await;
                let result = BatchResult::succeeded(batch_id, index, item_count, out, elapsed);
                (result, Settled::Processed)
            }
            (recovered, _) => {
                recoveries.push(BatchRecovery {
                    batch_index: index,
                    outcome: recovered.map_err(|e| e.to_string()),
                });
                let failed = FailedBatchRef {
                    processing_id: processing_id.to_string(),
                    batch_index: index,
                    item_offset,
                    item_count,
                };
                self.record_failure(&operation, failed, elapsed, &err).await;
                let result = BatchResult::failed(batch_id, index, item_count, err, elapsed);
                (result, Settled::Failed)
            }
        }
    }

    async fn record_success(
        &self,
        processing_id: &str,
        batch_index: usize,
        item_count: usize,
        elapsed: Duration,
    ) {
        self.sizer
            .record(ThroughputSample::new(item_count, elapsed, item_count, 0.0));
        emit(
            &self.events,
            RuntimeEvent::BatchCompleted {
                processing_id: processing_id.to_string(),
                batch_index,
                item_count,
                elapsed_ms: elapsed.as_millis() as u64,
            },
        )
        .await;
    }

    async fn record_failure(
        &self,
        operation: &str,
        failed: FailedBatchRef,
        elapsed: Duration,
        err: &Error,
    ) {
        let (batch_index, item_count) = (failed.batch_index, failed.item_count);
        self.sizer
            .record(ThroughputSample::new(item_count, elapsed, 0, 1.0));
        warn!(
            processing_id = %failed.processing_id,
            batch_index,
            item_count,
            error = %err,
            "batch failed"
        );
        emit(
            &self.events,
            RuntimeEvent::BatchFailed {
                processing_id: failed.processing_id.clone(),
                batch_index,
                item_count,
                error: err.to_string(),
                category: err.category_hint(),
            },
        )
        .await;

        self.dead_letters.push(
            DeadLetterEntry::from_error(operation, failed, err).with_batch_index(batch_index),
        );
        emit(
            &self.events,
            RuntimeEvent::DeadLettered {
                operation: operation.to_string(),
                batch_index: Some(batch_index),
                attempts: err.attempts(),
            },
        )
        .await;
    }

    async fn maybe_checkpoint(
        &self,
        processing_id: &str,
        total: usize,
        progress: &mut Progress,
        wave_failed: bool,
        last_saved: &mut Option<Instant>,
    ) {
        let policy = &self.config.checkpoint;
        if !policy.enabled || progress.finished_since_save == 0 {
            return;
        }
        let due = progress.finished_since_save >= policy.every_n_batches.max(1)
            || (policy.on_failure && wave_failed);
        let spaced = last_saved.map_or(true, |t| t.elapsed() >= policy.min_interval());
        if due && spaced {
            self.save_checkpoint(processing_id, total, progress).await;
            *last_saved = Some(Instant::now());
        }
    }

    async fn save_checkpoint(&self, processing_id: &str, total: usize, progress: &mut Progress) {
        let mut cp = Checkpoint::new(processing_id, total);
        cp.processed_count = progress.committed_processed;
        cp.failed_count = progress.committed_failed;
        cp.items_consumed = progress.items_consumed;
        cp.last_batch_index = progress.last_batch_index;
        let history = self.sizer.history();
        let keep = self.config.checkpoint.recent_metrics;
        cp.recent_metrics = history[history.len().saturating_sub(keep)..].to_vec();
        match self.recovery.create_checkpoint(&cp).await {
            Ok(()) => progress.finished_since_save = 0,
            Err(e) => warn!(processing_id, error = %e, "checkpoint save failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Processed,
    Failed,
    /// Not dispatched or cancelled mid-retry; the work is still owed.
    Unfinished,
}

/// Run counters. The `committed_*` fields and `items_consumed` cover only the
/// contiguous prefix of finished batches, which is what checkpoints record.
#[derive(Debug, Default)]
struct Progress {
    processed: usize,
    failed: usize,
    committed_processed: usize,
    committed_failed: usize,
    items_consumed: usize,
    last_batch_index: Option<usize>,
    next_index: usize,
    /// An unfinished batch ended the prefix; no further waves are dispatched.
    broken: bool,
    finished_since_save: usize,
}

impl Progress {
    fn resumed(point: &ResumePoint) -> Self {
        Self {
            processed: point.processed,
            failed: point.failed,
            committed_processed: point.processed,
            committed_failed: point.failed,
            items_consumed: point.items_consumed,
            last_batch_index: point.next_batch_index.checked_sub(1),
            next_index: point.next_batch_index,
            ..Self::default()
        }
    }

    fn apply<O>(&mut self, result: &BatchResult<O>, settled: Settled) {
        let n = result.item_count;
        match settled {
            Settled::Unfinished => {
                self.broken = true;
                return;
            }
            Settled::Processed => self.processed += n,
            Settled::Failed => self.failed += n,
        }
        self.finished_since_save += 1;
        if self.broken {
            return;
        }
        if settled == Settled::Processed {
            self.committed_processed += n;
        } else {
            self.committed_failed += n;
        }
        self.items_consumed += n;
        self.last_batch_index = Some(result.index);
    }
}

/// Per-run execution context shared by every batch task.
struct Unit<F: ResourceFactory, T, P> {
    pool: ConnectionPool<F>,
    retry: Arc<RetryCoordinator>,
    processor: Arc<P>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    batch_timeout: Option<Duration>,
    /// Batches of the current wave, kept so recovery can re-run failed ones.
    parked: Mutex<HashMap<usize, Arc<Batch<T>>>>,
}

impl<F, T, P> Unit<F, T, P>
where
    F: ResourceFactory,
    T: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    fn park(&self, batch: Batch<T>) -> Arc<Batch<T>> {
        let batch = Arc::new(batch);
        self.parked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(batch.index, batch.clone());
        batch
    }

    fn unpark(&self, index: usize) -> Option<Arc<Batch<T>>> {
        self.parked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&index)
    }

    /// One resource checkout, retried under the run's policy and breaker.
    async fn run<O>(&self, batch: &Batch<T>) -> anyhow::Result<O>
    where
        P: Processor<T, O, F::Handle>,
    {
        let guard = self.pool.acquire_guard().await?;
        let Some(handle) = guard.handle() else {
            return Err(anyhow::Error::new(Error::runtime("pooled resource already released")));
        };
        let result = self
            .retry
            .execute_with_cancel(
                self.processor.operation_key(),
                || self.processor.process(batch, handle),
                &self.policy,
                &self.cancel,
                Some(batch.index),
            )
            .await;
        guard.release().await;
        Ok(result?)
    }

    /// A single call without the retry loop; recovery supplies its own.
    async fn attempt_once<O>(&self, batch: &Batch<T>) -> anyhow::Result<O>
    where
        P: Processor<T, O, F::Handle>,
    {
        let guard = self.pool.acquire_guard().await?;
        let Some(handle) = guard.handle() else {
            return Err(anyhow::Error::new(Error::runtime("pooled resource already released")));
        };
        let result = self.processor.process(batch, handle).await;
        guard.release().await;
        result
    }
}

fn retry_operation<F, T, O, P>(
    unit: Arc<Unit<F, T, P>>,
    batch: Arc<Batch<T>>,
    slot: Arc<Mutex<Option<O>>>,
) -> RetryOperation
where
    F: ResourceFactory,
    T: Send + Sync + 'static,
    O: Send + 'static,
    P: Processor<T, O, F::Handle> + 'static,
{
    Arc::new(move || {
        let unit = unit.clone();
        let batch = batch.clone();
        let slot = slot.clone();
        async move {
            let out = unit.attempt_once::<O>(&batch).await?;
            *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(out);
            Ok::<(), anyhow::Error>(())
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ClassifiedError, ErrorCategory};
    use crate::execution::{ExecutionConfig, ExecutionMode};
    use crate::pool::{NoopResourceFactory, PoolConfig};
    use crate::recovery::{CheckpointPolicy, CheckpointStore, InMemoryCheckpointStore};
    use crate::sizing::SizingConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig::new()
            .with_sizing(SizingConfig::new().with_bounds(10, 50))
            .with_pool(PoolConfig::new().with_bounds(1, 4))
            .with_retry(
                RetryPolicy::new()
                    .with_max_retries(2)
                    .with_base_delay(Duration::from_millis(1))
                    .with_jitter(0.0),
            )
            .with_execution(ExecutionConfig::new().with_concurrency(3))
    }

    fn sum_processor() -> Arc<impl Processor<u32, u64, ()>> {
        Arc::new(FnProcessor::new(|items: Vec<u32>, _index: usize| async move {
            Ok::<_, anyhow::Error>(items.iter().map(|&i| i as u64).sum::<u64>())
        }))
    }

    #[tokio::test]
    async fn test_run_covers_every_item_in_order() {
        let orchestrator = BatchOrchestrator::builder(NoopResourceFactory)
            .with_config(fast_config())
            .build()
            .unwrap();
        let items: Vec<u32> = (0..137).collect();
        let report = orchestrator
            .process("sum", items, sum_processor())
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.processed, 137);
        assert_eq!(report.failed, 0);
        assert!(report.consistency_issues.is_empty());
        let sizes: usize = report.results.iter().map(|r| r.item_count).sum();
        assert_eq!(sizes, 137);
        for (i, r) in report.results.iter().enumerate() {
            assert_eq!(r.index, i);
        }
        assert_eq!(report.outputs().sum::<u64>(), (0..137u64).sum::<u64>());
    }

    #[tokio::test]
    async fn test_persistent_failure_is_dead_lettered_and_reprocessed() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let orchestrator = BatchOrchestrator::builder(NoopResourceFactory)
            .with_config(fast_config().with_checkpoint(CheckpointPolicy::new().with_every_n_batches(1)))
            .with_checkpoint_store(store.clone())
            .build()
            .unwrap();
        let healed = Arc::new(AtomicUsize::new(0));
        let h = healed.clone();
        let processor = Arc::new(FnProcessor::new(move |items: Vec<u32>, index: usize| {
            let healed = h.load(Ordering::SeqCst) > 0;
            async move {
                if index == 1 && !healed {
                    return Err(anyhow::Error::new(ClassifiedError::new(
                        ErrorCategory::Validation,
                        "negative amount",
                    )));
                }
                Ok(items.len())
            }
        }));

        let items: Vec<u32> = (0..60).collect();
        let report = orchestrator
            .process("dlq", items.clone(), processor.clone())
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.failed, report.results[1].item_count);
        assert_eq!(report.processed + report.failed, 60);
        assert_eq!(orchestrator.dead_letters().len(), 1);
        assert_eq!(report.recoveries.len(), 1);
        assert_eq!(store.get("dlq").unwrap().items_consumed, 60);

        healed.store(1, Ordering::SeqCst);
        let again = orchestrator
            .reprocess_dead_letters("dlq", &items, processor)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert!(again[0].is_success());
        assert!(orchestrator.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_prefix() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut cp = Checkpoint::new("resume", 100);
        cp.items_consumed = 40;
        cp.processed_count = 30;
        cp.failed_count = 10;
        cp.last_batch_index = Some(1);
        store.save("resume", &cp).await.unwrap();

        let orchestrator = BatchOrchestrator::builder(NoopResourceFactory)
            .with_config(fast_config().with_execution(
                ExecutionConfig::new().with_mode(ExecutionMode::Sequential),
            ))
            .with_checkpoint_store(store.clone())
            .build()
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let processor = Arc::new(FnProcessor::new(move |items: Vec<u32>, _index: usize| {
            s.lock().unwrap().extend(items.iter().copied());
            async move { Ok::<_, anyhow::Error>(()) }
        }));
        let report = orchestrator
            .process("resume", (0..100).collect(), processor)
            .await
            .unwrap();

        assert_eq!(report.resumed_from, Some(40));
        assert_eq!(report.processed, 90);
        assert_eq!(report.failed, 10);
        assert!(report.is_complete());
        assert_eq!(report.results[0].index, 2);
        assert_eq!(*seen.lock().unwrap(), (40..100).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_cancel_before_start_dispatches_nothing() {
        let orchestrator = BatchOrchestrator::builder(NoopResourceFactory)
            .with_config(fast_config())
            .build()
            .unwrap();
        orchestrator.cancel();
        let report = orchestrator
            .process("cancelled", (0..30).collect(), sum_processor())
            .await
            .unwrap();
        assert!(report.cancelled);
        assert!(report.results.is_empty());
        assert_eq!(report.items_consumed, 0);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_start_and_shutdown_manage_pool() {
        let orchestrator = BatchOrchestrator::builder(NoopResourceFactory)
            .with_config(fast_config().with_pool(PoolConfig::new().with_bounds(2, 4)))
            .build()
            .unwrap();
        assert_eq!(orchestrator.start().await, 2);
        assert_eq!(orchestrator.pool().stats().available, 2);
        orchestrator.shutdown().await;
        assert!(orchestrator.pool().acquire().await.is_err());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = BatchOrchestrator::builder(NoopResourceFactory)
            .with_config(RuntimeConfig::new().with_sizing(SizingConfig::new().with_bounds(0, 10)))
            .build();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
