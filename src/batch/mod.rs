//! 批次模块：定义批次、批次结果以及按大小边界切分工作项的规则。
//!
//! # Batches
//!
//! A [`Batch`] is a bounded slice of caller work items processed as one unit.
//! Batches are created by the orchestrator, are immutable once dispatched, and
//! are consumed exactly once by a worker.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Batch`] | Work unit: id, global index, items, weight, priority |
//! | [`BatchResult`] | One result slot, indexed by batch index |
//! | [`BatchOutcome`] | Succeeded / Failed / NotDispatched |
//! | [`next_batch_size`] | Chooses the next slice length without stranding a small tail |
//! | [`partition`] | Splits items into batches of planned sizes |

mod result;

pub use result::{BatchOutcome, BatchResult};
pub(crate) use result::success_rate;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub id: String,
    /// Position of this batch in the whole run (not just the current wave).
    pub index: usize,
    pub items: Vec<T>,
    pub estimated_weight: f64,
    pub priority: i32,
}

impl<T> Batch<T> {
    pub fn new(index: usize, items: Vec<T>) -> Self {
        let weight = items.len() as f64;
        Self {
            id: Uuid::new_v4().to_string(),
            index,
            items,
            estimated_weight: weight,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, p: i32) -> Self {
        self.priority = p;
        self
    }

    pub fn with_weight(mut self, w: f64) -> Self {
        self.estimated_weight = w;
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Size of the next batch to cut from `remaining` items.
///
/// `target` is clamped to `[min, max]`. When taking `target` would leave a tail
/// smaller than `min`, the rest is split evenly into two batches instead; when
/// everything left fits in one batch, it is taken whole.
pub fn next_batch_size(remaining: usize, target: usize, min: usize, max: usize) -> usize {
    if remaining == 0 {
        return 0;
    }
    let max = max.max(1);
    let min = min.clamp(1, max);
    let target = target.clamp(min, max);
    if remaining <= target {
        return remaining;
    }
    let tail = remaining - target;
    if tail >= min {
        return target;
    }
    if remaining <= max {
        return remaining;
    }
    // remaining < target + min <= 2 * max, so half of it fits in one batch
    remaining.div_ceil(2)
}

/// Plan every batch size for `total` items at a fixed `target`.
pub fn plan_sizes(total: usize, target: usize, min: usize, max: usize) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let take = next_batch_size(remaining, target, min, max);
        sizes.push(take);
        remaining -= take;
    }
    sizes
}

/// Cut `items` into batches of the given sizes, numbering from `first_index`.
///
/// Sizes beyond the item count are ignored; leftover items form one final batch.
pub fn partition<T>(items: Vec<T>, sizes: &[usize], first_index: usize) -> Vec<Batch<T>> {
    let mut batches = Vec::with_capacity(sizes.len());
    let mut iter = items.into_iter();
    let mut index = first_index;
    for &size in sizes {
        let chunk: Vec<T> = iter.by_ref().take(size).collect();
        if chunk.is_empty() {
            break;
        }
        batches.push(Batch::new(index, chunk));
        index += 1;
    }
    let rest: Vec<T> = iter.collect();
    if !rest.is_empty() {
        batches.push(Batch::new(index, rest));
    }
    batches
}
