//! 并行执行模块：以顺序、有界并行、流水线或工作窃取方式调度批次，并按输入顺序返回结果。
//!
//! # Parallel Execution Engine
//!
//! [`ParallelExecutionEngine::run`] takes pre-partitioned batches and a processor
//! and returns one [`BatchResult`] per input batch, at the batch's input position,
//! whatever order the batches complete in.
//!
//! | Mode | Scheduling |
//! |------|------------|
//! | [`ExecutionMode::Sequential`] | One batch at a time |
//! | [`ExecutionMode::BoundedParallel`] | Semaphore of `concurrency` permits, greedy dispatch |
//! | [`ExecutionMode::Pipelined`] | Fixed-width in-order stage queue |
//! | [`ExecutionMode::WorkStealing`] | `concurrency` workers with round-robin deques and tail stealing |
//!
//! A failing batch only fills its own slot. With `fail_fast`, or once the
//! cancellation token fires, no new batch is dispatched; in-flight batches run
//! to completion or to their own timeout, and undispatched ones are reported as
//! [`crate::batch::BatchOutcome::NotDispatched`].

mod work_stealing;

pub use work_stealing::{Taken, WorkQueues};

use crate::batch::{Batch, BatchResult};
use crate::classify::ClassifiedError;
use crate::Error;
use futures::FutureExt;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    #[default]
    BoundedParallel,
    Pipelined,
    WorkStealing,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::BoundedParallel => "bounded_parallel",
            ExecutionMode::Pipelined => "pipelined",
            ExecutionMode::WorkStealing => "work_stealing",
        }
    }
}

/// Serializable execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    pub concurrency: usize,
    pub fail_fast: bool,
    /// Per-batch timeout; `None` disables it.
    pub batch_timeout_ms: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            concurrency: 4,
            fail_fast: false,
            batch_timeout_ms: Some(300_000),
        }
    }
}

impl ExecutionConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }
    pub fn with_fail_fast(mut self, on: bool) -> Self {
        self.fail_fast = on;
        self
    }
    pub fn with_batch_timeout(mut self, d: Option<Duration>) -> Self {
        self.batch_timeout_ms = d.map(|d| d.as_millis() as u64);
        self
    }
}

/// Execution settings plus the run's cancellation token.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub mode: ExecutionMode,
    pub concurrency: usize,
    pub fail_fast: bool,
    pub batch_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl ExecutionOptions {
    pub fn new(mode: ExecutionMode, concurrency: usize) -> Self {
        Self {
            mode,
            concurrency,
            ..Self::default()
        }
    }
    pub fn with_fail_fast(mut self, on: bool) -> Self {
        self.fail_fast = on;
        self
    }
    pub fn with_batch_timeout(mut self, d: Duration) -> Self {
        self.batch_timeout = Some(d);
        self
    }
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl From<&ExecutionConfig> for ExecutionOptions {
    fn from(cfg: &ExecutionConfig) -> Self {
        Self {
            mode: cfg.mode,
            concurrency: cfg.concurrency,
            fail_fast: cfg.fail_fast,
            batch_timeout: cfg.batch_timeout_ms.map(Duration::from_millis),
            cancel: CancellationToken::new(),
        }
    }
}

/// Identity of a batch, kept so undispatched slots can still be filled.
#[derive(Clone)]
struct Slot {
    batch_id: String,
    index: usize,
    item_count: usize,
}

impl Slot {
    fn of<T>(batch: &Batch<T>) -> Self {
        Self {
            batch_id: batch.id.clone(),
            index: batch.index,
            item_count: batch.len(),
        }
    }

    fn not_dispatched<O>(&self) -> BatchResult<O> {
        BatchResult::not_dispatched(self.batch_id.clone(), self.index, self.item_count)
    }
}

/// Shared stop condition: cancellation, or a failure under fail-fast.
#[derive(Clone)]
struct Gate {
    cancel: CancellationToken,
    fail_fast: bool,
    tripped: Arc<AtomicBool>,
}

impl Gate {
    fn closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tripped.load(Ordering::SeqCst)
    }

    fn observe<O>(&self, result: &BatchResult<O>) {
        if self.fail_fast && result.is_failed() {
            self.tripped.store(true, Ordering::SeqCst);
        }
    }
}

/// Turn a processor error into a batch error, keeping runtime errors intact.
fn batch_error(slot: &Slot, err: anyhow::Error) -> Error {
    into_batch_error(&slot.batch_id, slot.index, err)
}

pub(crate) fn into_batch_error(batch_id: &str, index: usize, err: anyhow::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(e) => e,
        Err(err) => {
            let category = err
                .downcast_ref::<ClassifiedError>()
                .map(|c| c.category);
            Error::BatchExecution {
                batch_id: batch_id.to_string(),
                index,
                message: format!("{:#}", err),
                category,
            }
        }
    }
}

async fn run_one<T, O, P, Fut>(batch: Batch<T>, process: &P, timeout: Option<Duration>) -> BatchResult<O>
where
    P: Fn(Batch<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<O>>,
{
    let slot = Slot::of(&batch);
    let started = Instant::now();
    let fut = AssertUnwindSafe(process(batch)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(r) => r,
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(batch_index = slot.index, elapsed_ms, "batch timed out");
                return BatchResult::failed(
                    slot.batch_id,
                    slot.index,
                    slot.item_count,
                    Error::Timeout { elapsed_ms },
                    started.elapsed(),
                );
            }
        },
        None => fut.await,
    };
    let elapsed = started.elapsed();
    match outcome {
        Ok(Ok(output)) => {
            BatchResult::succeeded(slot.batch_id, slot.index, slot.item_count, output, elapsed)
        }
        Ok(Err(e)) => {
            let err = batch_error(&slot, e);
            debug!(batch_index = slot.index, error = %err, "batch failed");
            BatchResult::failed(slot.batch_id.clone(), slot.index, slot.item_count, err, elapsed)
        }
        Err(_) => {
            warn!(batch_index = slot.index, "batch processor panicked");
            let err = Error::BatchExecution {
                batch_id: slot.batch_id.clone(),
                index: slot.index,
                message: "processor panicked".to_string(),
                category: None,
            };
            BatchResult::failed(slot.batch_id, slot.index, slot.item_count, err, elapsed)
        }
    }
}

/// Schedules batches under one of the [`ExecutionMode`]s.
#[derive(Debug, Clone, Default)]
pub struct ParallelExecutionEngine {
    options: ExecutionOptions,
}

impl ParallelExecutionEngine {
    pub fn new(options: ExecutionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Run every batch through `process`; `results[i]` belongs to `batches[i]`.
    pub async fn run<T, O, P, Fut>(&self, batches: Vec<Batch<T>>, process: P) -> Vec<BatchResult<O>>
    where
        T: Send + 'static,
        O: Send + 'static,
        P: Fn(Batch<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        if batches.is_empty() {
            return Vec::new();
        }
        let width = self.options.concurrency.max(1);
        let gate = Gate {
            cancel: self.options.cancel.clone(),
            fail_fast: self.options.fail_fast,
            tripped: Arc::new(AtomicBool::new(false)),
        };
        let slots: Vec<Slot> = batches.iter().map(Slot::of).collect();
        info!(
            mode = self.options.mode.as_str(),
            batches = batches.len(),
            concurrency = width,
            "dispatching batches"
        );

        let filled = match self.options.mode {
            ExecutionMode::Sequential => self.sequential(batches, &process, &gate).await,
            ExecutionMode::BoundedParallel => {
                self.bounded(batches, Arc::new(process), width, &gate).await
            }
            ExecutionMode::Pipelined => self.pipelined(batches, &process, width, &gate).await,
            ExecutionMode::WorkStealing => {
                self.work_stealing(batches, Arc::new(process), width, &gate).await
            }
        };

        filled
            .into_iter()
            .zip(slots.iter())
            .map(|(r, slot)| r.unwrap_or_else(|| slot.not_dispatched()))
            .collect()
    }

    async fn sequential<T, O, P, Fut>(
        &self,
        batches: Vec<Batch<T>>,
        process: &P,
        gate: &Gate,
    ) -> Vec<Option<BatchResult<O>>>
    where
        P: Fn(Batch<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<O>>,
    {
        let mut out = Vec::with_capacity(batches.len());
        for batch in batches {
            if gate.closed() {
                out.push(None);
                continue;
            }
            let r = run_one(batch, process, self.options.batch_timeout).await;
            gate.observe(&r);
            out.push(Some(r));
        }
        out
    }

    async fn bounded<T, O, P, Fut>(
        &self,
        batches: Vec<Batch<T>>,
        process: Arc<P>,
        width: usize,
        gate: &Gate,
    ) -> Vec<Option<BatchResult<O>>>
    where
        T: Send + 'static,
        O: Send + 'static,
        P: Fn(Batch<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let mut out: Vec<Option<BatchResult<O>>> = (0..batches.len()).map(|_| None).collect();
        let semaphore = Arc::new(Semaphore::new(width));
        let mut join_set: JoinSet<(usize, BatchResult<O>)> = JoinSet::new();

        for (pos, batch) in batches.into_iter().enumerate() {
            let permit = tokio::select! {
                p = semaphore.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = gate.cancel.cancelled() => break,
            };
            if gate.closed() {
                break;
            }
            let process = process.clone();
            let gate = gate.clone();
            let timeout = self.options.batch_timeout;
            join_set.spawn(async move {
                let r = run_one(batch, process.as_ref(), timeout).await;
                gate.observe(&r);
                drop(permit);
                (pos, r)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((pos, r)) => out[pos] = Some(r),
                Err(e) => warn!(error = %e, "batch task aborted"),
            }
        }
        out
    }

    async fn pipelined<T, O, P, Fut>(
        &self,
        batches: Vec<Batch<T>>,
        process: &P,
        width: usize,
        gate: &Gate,
    ) -> Vec<Option<BatchResult<O>>>
    where
        P: Fn(Batch<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<O>>,
    {
        let timeout = self.options.batch_timeout;
        futures::stream::iter(batches)
            .map(|batch| async move {
                // Checked when the stage admits the batch, not when it was queued.
                if gate.closed() {
                    return None;
                }
                let r = run_one(batch, process, timeout).await;
                gate.observe(&r);
                Some(r)
            })
            .buffered(width)
            .collect()
            .await
    }

    async fn work_stealing<T, O, P, Fut>(
        &self,
        batches: Vec<Batch<T>>,
        process: Arc<P>,
        width: usize,
        gate: &Gate,
    ) -> Vec<Option<BatchResult<O>>>
    where
        T: Send + 'static,
        O: Send + 'static,
        P: Fn(Batch<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let total = batches.len();
        let workers = width.min(total).max(1);
        let queues = Arc::new(WorkQueues::round_robin(workers, batches.into_iter().enumerate()));
        let steals = Arc::new(AtomicUsize::new(0));
        let mut join_set: JoinSet<Vec<(usize, BatchResult<O>)>> = JoinSet::new();

        for worker in 0..workers {
            let queues = queues.clone();
            let process = process.clone();
            let gate = gate.clone();
            let steals = steals.clone();
            let timeout = self.options.batch_timeout;
            join_set.spawn(async move {
                let mut done = Vec::new();
                while !gate.closed() {
                    let Some(((pos, batch), taken)) = queues.next(worker) else {
                        break;
                    };
                    if let Taken::Stolen { from } = taken {
                        steals.fetch_add(1, Ordering::Relaxed);
                        debug!(worker, victim = from, batch_index = batch.index, "stole batch");
                    }
                    let r = run_one(batch, process.as_ref(), timeout).await;
                    gate.observe(&r);
                    done.push((pos, r));
                }
                done
            });
        }

        let mut out: Vec<Option<BatchResult<O>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(done) => {
                    for (pos, r) in done {
                        out[pos] = Some(r);
                    }
                }
                Err(e) => warn!(error = %e, "work-stealing worker aborted"),
            }
        }
        let undispatched = queues.drain_all().len();
        debug!(
            workers,
            steals = steals.load(Ordering::Relaxed),
            undispatched,
            "work-stealing run finished"
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::partition;
    use std::sync::atomic::AtomicUsize;

    fn batches(n: usize) -> Vec<Batch<usize>> {
        partition((0..n * 3).collect(), &vec![3; n], 0)
    }

    async fn run_mode(mode: ExecutionMode) -> Vec<BatchResult<usize>> {
        let engine = ParallelExecutionEngine::new(ExecutionOptions::new(mode, 3));
        engine
            .run(batches(10), |b: Batch<usize>| async move {
                // later batches finish first
                tokio::time::sleep(Duration::from_millis((10 - b.index as u64) * 2)).await;
                Ok::<_, anyhow::Error>(b.items.iter().sum::<usize>())
            })
            .await
    }

    #[tokio::test]
    async fn test_every_mode_preserves_order() {
        for mode in [
            ExecutionMode::Sequential,
            ExecutionMode::BoundedParallel,
            ExecutionMode::Pipelined,
            ExecutionMode::WorkStealing,
        ] {
            let results = run_mode(mode).await;
            assert_eq!(results.len(), 10);
            for (i, r) in results.iter().enumerate() {
                assert_eq!(r.index, i, "{:?}", mode);
                assert_eq!(r.output(), Some(&(9 * i + 3)), "{:?}", mode);
            }
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let engine = ParallelExecutionEngine::new(ExecutionOptions::new(ExecutionMode::BoundedParallel, 4));
        let results = engine
            .run(batches(5), |b: Batch<usize>| async move {
                if b.index == 2 {
                    anyhow::bail!("boom")
                }
                Ok(b.index)
            })
            .await;
        assert!(results[2].is_failed());
        assert!(matches!(
            results[2].error(),
            Some(Error::BatchExecution { index: 2, .. })
        ));
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 4);
    }

    #[tokio::test]
    async fn test_bounded_never_exceeds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let engine = ParallelExecutionEngine::new(ExecutionOptions::new(ExecutionMode::BoundedParallel, 2));
        let (f, p) = (in_flight.clone(), peak.clone());
        engine
            .run(batches(8), move |_b: Batch<usize>| {
                let (f, p) = (f.clone(), p.clone());
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_dispatch() {
        let engine = ParallelExecutionEngine::new(
            ExecutionOptions::new(ExecutionMode::Sequential, 1).with_fail_fast(true),
        );
        let results = engine
            .run(batches(5), |b: Batch<usize>| async move {
                if b.index == 1 {
                    anyhow::bail!("stop here")
                }
                Ok(())
            })
            .await;
        assert!(results[0].is_success());
        assert!(results[1].is_failed());
        assert!(results[2..].iter().all(|r| !r.was_dispatched()));
    }

    #[tokio::test]
    async fn test_timeout_fills_slot() {
        let engine = ParallelExecutionEngine::new(
            ExecutionOptions::new(ExecutionMode::Pipelined, 2).with_batch_timeout(Duration::from_millis(10)),
        );
        let results = engine
            .run(batches(2), |b: Batch<usize>| async move {
                if b.index == 0 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok::<_, anyhow::Error>(())
            })
            .await;
        assert!(matches!(results[0].error(), Some(Error::Timeout { .. })));
        assert!(results[1].is_success());
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = ParallelExecutionEngine::new(
            ExecutionOptions::new(ExecutionMode::WorkStealing, 3).with_cancel(cancel),
        );
        let results = engine
            .run(batches(4), |_b: Batch<usize>| async move { Ok::<_, anyhow::Error>(()) })
            .await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| !r.was_dispatched()));
    }

    #[tokio::test]
    async fn test_panicking_processor_is_contained() {
        let engine = ParallelExecutionEngine::new(ExecutionOptions::new(ExecutionMode::BoundedParallel, 2));
        let results = engine
            .run(batches(3), |b: Batch<usize>| async move {
                if b.index == 1 {
                    panic!("processor bug");
                }
                Ok::<_, anyhow::Error>(())
            })
            .await;
        assert!(results[0].is_success());
        assert!(results[1].is_failed());
        assert!(results[2].is_success());
    }
}
