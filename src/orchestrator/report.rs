//! What a run hands back to the caller.

use crate::batch::{success_rate, BatchResult};
use crate::recovery::{ConsistencyIssue, RecoveryOutcome};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dead-letter payload: where a failed batch sits in the caller's item list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBatchRef {
    pub processing_id: String,
    pub batch_index: usize,
    pub item_offset: usize,
    pub item_count: usize,
}

/// Recovery applied to one batch that escaped the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecovery {
    pub batch_index: usize,
    /// `Err` holds the message of a strategy that itself failed.
    pub outcome: Result<RecoveryOutcome, String>,
}

#[derive(Debug)]
pub struct RunReport<O> {
    pub processing_id: String,
    pub total: usize,
    /// Items in successful batches, including those counted by an earlier run.
    pub processed: usize,
    pub failed: usize,
    /// Length of the finished contiguous prefix of the item list.
    pub items_consumed: usize,
    /// `items_consumed` of the checkpoint this run resumed from.
    pub resumed_from: Option<usize>,
    /// This run's batches in batch order.
    pub results: Vec<BatchResult<O>>,
    pub recoveries: Vec<BatchRecovery>,
    pub consistency_issues: Vec<ConsistencyIssue>,
    pub cancelled: bool,
    /// Dispatch stopped after a failed wave because `fail_fast` is set.
    pub stopped_on_failure: bool,
    pub elapsed: Duration,
}

impl<O> RunReport<O> {
    pub fn is_complete(&self) -> bool {
        self.items_consumed == self.total && self.processed + self.failed == self.total
    }

    /// Outputs of successful batches, in batch order.
    pub fn outputs(&self) -> impl Iterator<Item = &O> {
        self.results.iter().filter_map(BatchResult::output)
    }

    pub fn failed_batches(&self) -> impl Iterator<Item = &BatchResult<O>> {
        self.results.iter().filter(|r| r.is_failed())
    }

    /// Share of this run's dispatched batches that succeeded.
    pub fn batch_success_rate(&self) -> f64 {
        success_rate(&self.results)
    }
}
