//! Per-worker deques with tail stealing.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// One deque per worker. Owners pop from the front; idle workers steal from the
/// back of the most-loaded peer.
pub struct WorkQueues<J> {
    queues: Vec<Mutex<VecDeque<J>>>,
}

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Taken {
    Own,
    Stolen { from: usize },
}

impl<J> WorkQueues<J> {
    /// Distribute `jobs` round-robin over `workers` queues.
    pub fn round_robin(workers: usize, jobs: impl IntoIterator<Item = J>) -> Self {
        let workers = workers.max(1);
        let mut queues: Vec<VecDeque<J>> = (0..workers).map(|_| VecDeque::new()).collect();
        for (i, job) in jobs.into_iter().enumerate() {
            queues[i % workers].push_back(job);
        }
        Self {
            queues: queues.into_iter().map(Mutex::new).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    fn queue(&self, i: usize) -> MutexGuard<'_, VecDeque<J>> {
        self.queues[i].lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len_of(&self, worker: usize) -> usize {
        self.queue(worker).len()
    }

    pub fn total_len(&self) -> usize {
        (0..self.queues.len()).map(|i| self.len_of(i)).sum()
    }

    /// Next job for `worker`: its own front, otherwise a steal.
    ///
    /// Returns `None` only once every queue is empty.
    pub fn next(&self, worker: usize) -> Option<(J, Taken)> {
        if let Some(job) = self.queue(worker).pop_front() {
            return Some((job, Taken::Own));
        }
        loop {
            // Most-loaded peer, lowest index on ties.
            let victim = (0..self.queues.len())
                .filter(|&i| i != worker)
                .map(|i| (i, self.len_of(i)))
                .filter(|&(_, len)| len > 0)
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
                .map(|(i, _)| i)?;
            // The victim may have drained since the scan; rescan in that case.
            if let Some(job) = self.queue(victim).pop_back() {
                return Some((job, Taken::Stolen { from: victim }));
            }
        }
    }

    /// Empty every queue, returning what was left.
    pub fn drain_all(&self) -> Vec<J> {
        let mut left = Vec::new();
        for i in 0..self.queues.len() {
            left.extend(self.queue(i).drain(..));
        }
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_distribution() {
        let q = WorkQueues::round_robin(3, 0..7);
        assert_eq!(q.len_of(0), 3);
        assert_eq!(q.len_of(1), 2);
        assert_eq!(q.len_of(2), 2);
    }

    #[test]
    fn test_owner_pops_front() {
        let q = WorkQueues::round_robin(2, 0..4);
        assert_eq!(q.next(0), Some((0, Taken::Own)));
        assert_eq!(q.next(0), Some((2, Taken::Own)));
    }

    #[test]
    fn test_idle_worker_steals_tail_of_most_loaded() {
        let q = WorkQueues::round_robin(3, 0..7);
        // worker 1 drains its own queue (1, 4)
        q.next(1);
        q.next(1);
        // worker 0 holds 0, 3, 6 and is the most loaded
        assert_eq!(q.next(1), Some((6, Taken::Stolen { from: 0 })));
        // now 0 and 2 both hold two jobs; the lower index wins the tie
        assert_eq!(q.next(1), Some((3, Taken::Stolen { from: 0 })));
    }

    #[test]
    fn test_none_when_everything_is_empty() {
        let q = WorkQueues::round_robin(2, 0..1);
        assert!(q.next(1).is_some());
        assert!(q.next(0).is_none());
        assert!(q.next(1).is_none());
        assert_eq!(q.total_len(), 0);
    }

    #[test]
    fn test_drain_all() {
        let q = WorkQueues::round_robin(2, 0..5);
        q.next(0);
        let mut left = q.drain_all();
        left.sort();
        assert_eq!(left, vec![1, 2, 3, 4]);
    }
}
