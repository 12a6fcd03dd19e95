//! Backoff strategies and the adaptive delay learner.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Function from attempt number to delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
    /// Learned per-operation delay blended with exponential exploration.
    Adaptive,
}

/// Share of the learned delay in the adaptive blend.
const ADAPTIVE_LEARNED_WEIGHT: f64 = 0.7;
/// Samples needed before the learned delay is trusted.
const ADAPTIVE_MIN_SAMPLES: usize = 3;

/// Un-jittered delay for the `failed_attempt`-th failure (1-based).
pub fn base_delay(strategy: BackoffStrategy, failed_attempt: u32, base: Duration) -> Duration {
    let n = failed_attempt.max(1);
    let base_ms = base.as_millis() as u64;
    let ms = match strategy {
        BackoffStrategy::Exponential | BackoffStrategy::Adaptive => {
            let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
            base_ms.saturating_mul(factor)
        }
        BackoffStrategy::Linear => base_ms.saturating_mul(u64::from(n)),
        BackoffStrategy::Fixed => base_ms,
        BackoffStrategy::Fibonacci => base_ms.saturating_mul(fibonacci(n)),
    };
    Duration::from_millis(ms)
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}

/// Uniform sample in `[0, 1]`, drawn from the v4 UUID generator.
pub(crate) fn unit_random() -> f64 {
    let bits = (Uuid::new_v4().as_u128() >> 64) as u64;
    bits as f64 / u64::MAX as f64
}

/// Apply symmetric `±pct` jitter.
pub fn apply_jitter(delay: Duration, pct: f64) -> Duration {
    if pct <= 0.0 || delay.is_zero() {
        return delay;
    }
    let pct = pct.min(1.0);
    let factor = 1.0 + pct * (2.0 * unit_random() - 1.0);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}

#[derive(Debug, Clone, Copy)]
struct DelaySample {
    delay_ms: u64,
    succeeded: bool,
}

/// Rolling per-operation record of which retry delays were followed by a success.
///
/// Bounded two ways: at most `max_operations` keys (LRU eviction) and at most
/// `window` samples per key.
pub struct AdaptiveDelayTracker {
    window: usize,
    samples: Mutex<LruCache<String, VecDeque<DelaySample>>>,
}

impl AdaptiveDelayTracker {
    pub fn new(max_operations: usize, window: usize) -> Self {
        let cap = NonZeroUsize::new(max_operations.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            window: window.max(1),
            samples: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn record(&self, operation: &str, delay: Duration, succeeded: bool) {
        let mut cache = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        let sample = DelaySample {
            delay_ms: delay.as_millis() as u64,
            succeeded,
        };
        if let Some(window) = cache.get_mut(operation) {
            window.push_back(sample);
            while window.len() > self.window {
                window.pop_front();
            }
            return;
        }
        let mut window = VecDeque::with_capacity(self.window);
        window.push_back(sample);
        cache.put(operation.to_string(), window);
    }

    /// Historically best delay for `operation`, if enough samples exist.
    ///
    /// Mean of the delays that were followed by a success; when nothing has
    /// succeeded yet, 1.5x the longest delay tried.
    pub fn learned_delay(&self, operation: &str) -> Option<Duration> {
        let mut cache = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        let window = cache.get(operation)?;
        if window.len() < ADAPTIVE_MIN_SAMPLES {
            return None;
        }
        let wins: Vec<u64> = window
            .iter()
            .filter(|s| s.succeeded)
            .map(|s| s.delay_ms)
            .collect();
        let ms = if wins.is_empty() {
            let longest = window.iter().map(|s| s.delay_ms).max().unwrap_or(0);
            longest.saturating_mul(3) / 2
        } else {
            wins.iter().sum::<u64>() / wins.len() as u64
        };
        Some(Duration::from_millis(ms))
    }

    pub fn sample_count(&self, operation: &str) -> usize {
        let mut cache = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(operation).map(|w| w.len()).unwrap_or(0)
    }

    /// Adaptive delay: learned delay blended with exponential exploration.
    pub fn blended_delay(&self, operation: &str, failed_attempt: u32, base: Duration) -> Duration {
        let exploration = base_delay(BackoffStrategy::Exponential, failed_attempt, base);
        match self.learned_delay(operation) {
            Some(learned) => Duration::from_secs_f64(
                ADAPTIVE_LEARNED_WEIGHT * learned.as_secs_f64()
                    + (1.0 - ADAPTIVE_LEARNED_WEIGHT) * exploration.as_secs_f64(),
            ),
            None => exploration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);

    #[test]
    fn test_exponential_sequence() {
        let delays: Vec<u128> = (1..=4)
            .map(|n| base_delay(BackoffStrategy::Exponential, n, BASE).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn test_linear_fixed_fibonacci() {
        let linear: Vec<u128> = (1..=3)
            .map(|n| base_delay(BackoffStrategy::Linear, n, BASE).as_millis())
            .collect();
        assert_eq!(linear, vec![100, 200, 300]);
        assert_eq!(base_delay(BackoffStrategy::Fixed, 7, BASE).as_millis(), 100);
        let fib: Vec<u128> = (1..=6)
            .map(|n| base_delay(BackoffStrategy::Fibonacci, n, BASE).as_millis())
            .collect();
        assert_eq!(fib, vec![100, 100, 200, 300, 500, 800]);
    }

    #[test]
    fn test_exponential_saturates() {
        let d = base_delay(BackoffStrategy::Exponential, 200, BASE);
        assert!(d >= Duration::from_secs(1_000_000));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..200 {
            let d = apply_jitter(Duration::from_millis(1000), 0.1).as_millis();
            assert!((900..=1100).contains(&d), "jittered delay {} out of bounds", d);
        }
        assert_eq!(
            apply_jitter(Duration::from_millis(1000), 0.0),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_adaptive_needs_samples() {
        let tracker = AdaptiveDelayTracker::new(8, 16);
        tracker.record("op", Duration::from_millis(300), true);
        assert!(tracker.learned_delay("op").is_none());
        assert_eq!(tracker.blended_delay("op", 1, BASE), BASE);
    }

    #[test]
    fn test_adaptive_learns_successful_delay() {
        let tracker = AdaptiveDelayTracker::new(8, 16);
        tracker.record("op", Duration::from_millis(100), false);
        tracker.record("op", Duration::from_millis(500), true);
        tracker.record("op", Duration::from_millis(500), true);
        assert_eq!(tracker.learned_delay("op"), Some(Duration::from_millis(500)));
        // 0.7 * 500 + 0.3 * 100
        let blended = tracker.blended_delay("op", 1, BASE).as_millis();
        assert!((379..=381).contains(&blended));
    }

    #[test]
    fn test_adaptive_window_and_lru_bounds() {
        let tracker = AdaptiveDelayTracker::new(2, 4);
        for _ in 0..10 {
            tracker.record("a", Duration::from_millis(10), false);
        }
        assert_eq!(tracker.sample_count("a"), 4);
        tracker.record("b", Duration::from_millis(10), false);
        tracker.record("c", Duration::from_millis(10), false);
        assert_eq!(tracker.sample_count("a"), 0);
        assert_eq!(tracker.sample_count("c"), 1);
    }
}
