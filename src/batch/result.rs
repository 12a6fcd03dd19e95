//! Batch result slots.

use crate::Error;
use std::time::Duration;

#[derive(Debug)]
pub enum BatchOutcome<O> {
    Succeeded(O),
    /// Isolated failure; siblings are unaffected.
    Failed(Error),
    /// Never started: dispatch stopped (cancellation or fail-fast) before this batch.
    NotDispatched,
}

/// Outcome of one batch, stored at `results[index]`.
#[derive(Debug)]
pub struct BatchResult<O> {
    pub batch_id: String,
    pub index: usize,
    pub item_count: usize,
    pub outcome: BatchOutcome<O>,
    pub elapsed: Duration,
}

impl<O> BatchResult<O> {
    pub fn succeeded(batch_id: String, index: usize, item_count: usize, output: O, elapsed: Duration) -> Self {
        Self {
            batch_id,
            index,
            item_count,
            outcome: BatchOutcome::Succeeded(output),
            elapsed,
        }
    }

    pub fn failed(batch_id: String, index: usize, item_count: usize, error: Error, elapsed: Duration) -> Self {
        Self {
            batch_id,
            index,
            item_count,
            outcome: BatchOutcome::Failed(error),
            elapsed,
        }
    }

    pub fn not_dispatched(batch_id: String, index: usize, item_count: usize) -> Self {
        Self {
            batch_id,
            index,
            item_count,
            outcome: BatchOutcome::NotDispatched,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Failed(_))
    }

    pub fn was_dispatched(&self) -> bool {
        !matches!(self.outcome, BatchOutcome::NotDispatched)
    }

    pub fn output(&self) -> Option<&O> {
        match &self.outcome {
            BatchOutcome::Succeeded(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_output(self) -> Option<O> {
        match self.outcome {
            BatchOutcome::Succeeded(o) => Some(o),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            BatchOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Success ratio over dispatched batches.
pub(crate) fn success_rate<O>(results: &[BatchResult<O>]) -> f64 {
    let dispatched = results.iter().filter(|r| r.was_dispatched()).count();
    if dispatched == 0 {
        0.0
    } else {
        results.iter().filter(|r| r.is_success()).count() as f64 / dispatched as f64
    }
}
