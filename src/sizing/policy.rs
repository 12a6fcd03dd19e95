//! Batch-size policies.

use super::{LoadSignal, ThroughputSample};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("not enough samples: {have} < {need}")]
    InsufficientSamples { have: usize, need: usize },
    #[error("degenerate history: batch sizes do not vary")]
    Degenerate,
    #[error("model produced a non-finite prediction")]
    NonFinite,
}

/// Tunable batch-size policy.
///
/// `bounds` is `(min, max)`; implementations may return sizes outside it, the
/// sizer clamps.
pub trait SizingPolicy: Send + Sync {
    fn propose(
        &self,
        window: &[ThroughputSample],
        current: usize,
        load: &LoadSignal,
        bounds: (usize, usize),
    ) -> Result<usize, SizingError>;
}

/// Linear throughput model plus trend and load adjustments.
#[derive(Debug, Clone)]
pub struct RegressionPolicy {
    /// Number of candidate steps scanned between min and max.
    pub candidate_steps: usize,
    /// Weight of the model's optimum versus the trend-adjusted current size.
    pub optimizer_weight: f64,
    pub min_samples: usize,
}

impl Default for RegressionPolicy {
    fn default() -> Self {
        Self {
            candidate_steps: 20,
            optimizer_weight: 0.5,
            min_samples: 2,
        }
    }
}

impl RegressionPolicy {
    /// Least-squares fit of throughput against batch size: `(intercept, slope)`.
    pub fn fit(window: &[ThroughputSample]) -> Result<(f64, f64), SizingError> {
        let n = window.len() as f64;
        let mean_x = window.iter().map(|s| s.batch_size as f64).sum::<f64>() / n;
        let mean_y = window.iter().map(|s| s.throughput()).sum::<f64>() / n;
        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for s in window {
            let dx = s.batch_size as f64 - mean_x;
            sxx += dx * dx;
            sxy += dx * (s.throughput() - mean_y);
        }
        if sxx.abs() < 1e-9 {
            return Err(SizingError::Degenerate);
        }
        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        if !slope.is_finite() || !intercept.is_finite() {
            return Err(SizingError::NonFinite);
        }
        Ok((intercept, slope))
    }

    /// `1.1` when throughput is trending up and errors are not, `0.9` otherwise.
    pub fn trend_factor(window: &[ThroughputSample]) -> f64 {
        if window.len() < 2 {
            return 1.0;
        }
        let (older, recent) = window.split_at(window.len() / 2);
        let avg = |xs: &[ThroughputSample], f: fn(&ThroughputSample) -> f64| {
            xs.iter().map(f).sum::<f64>() / xs.len().max(1) as f64
        };
        let tp_trend = avg(recent, ThroughputSample::throughput) - avg(older, ThroughputSample::throughput);
        let err_trend = avg(recent, |s| s.error_rate) - avg(older, |s| s.error_rate);
        if tp_trend > 0.0 && err_trend <= 0.0 {
            1.1
        } else {
            0.9
        }
    }
}

impl SizingPolicy for RegressionPolicy {
    fn propose(
        &self,
        window: &[ThroughputSample],
        current: usize,
        load: &LoadSignal,
        bounds: (usize, usize),
    ) -> Result<usize, SizingError> {
        if window.len() < self.min_samples {
            return Err(SizingError::InsufficientSamples {
                have: window.len(),
                need: self.min_samples,
            });
        }
        let (intercept, slope) = Self::fit(window)?;

        let (min, max) = (bounds.0.max(1), bounds.1.max(bounds.0.max(1)));
        let step = ((max - min) / self.candidate_steps.max(1)).max(1);
        let mut best = (min, f64::NEG_INFINITY);
        let mut candidate = min;
        while candidate <= max {
            let predicted = intercept + slope * candidate as f64;
            if predicted > best.1 {
                best = (candidate, predicted);
            }
            candidate += step;
        }
        if !best.1.is_finite() {
            return Err(SizingError::NonFinite);
        }

        let w = self.optimizer_weight.clamp(0.0, 1.0);
        let trended = current as f64 * Self::trend_factor(window);
        let blended = (w * best.0 as f64 + (1.0 - w) * trended) * load.dampening();
        if !blended.is_finite() {
            return Err(SizingError::NonFinite);
        }
        Ok(blended.round().max(1.0) as usize)
    }
}

/// Load and error driven nudge of the current size, used while history is short.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicPolicy;

impl SizingPolicy for HeuristicPolicy {
    fn propose(
        &self,
        window: &[ThroughputSample],
        current: usize,
        load: &LoadSignal,
        _bounds: (usize, usize),
    ) -> Result<usize, SizingError> {
        let error_rate = window.last().map(|s| s.error_rate).unwrap_or(0.0);
        let pressure = load.pressure();
        let mut factor = if error_rate > 0.1 {
            0.75
        } else if error_rate < 0.01 && pressure < 0.3 {
            1.2
        } else {
            1.0
        };
        if pressure > 0.8 {
            factor *= 0.7;
        }
        Ok(((current as f64) * factor).round().max(1.0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn s(size: usize, ms: u64) -> ThroughputSample {
        ThroughputSample::new(size, Duration::from_millis(ms), size, 0.0)
    }

    #[test]
    fn test_fit_recovers_slope() {
        // throughput = 10 * size
        let window: Vec<_> = [10, 20, 30, 40].iter().map(|&n| s(n, 100)).collect();
        let (intercept, slope) = RegressionPolicy::fit(&window).unwrap();
        assert!((slope - 10.0).abs() < 1e-6);
        assert!(intercept.abs() < 1e-6);
    }

    #[test]
    fn test_fit_rejects_constant_sizes() {
        let window = vec![s(10, 100), s(10, 200)];
        assert_eq!(RegressionPolicy::fit(&window), Err(SizingError::Degenerate));
    }

    #[test]
    fn test_trend_factor() {
        let rising = vec![s(10, 200), s(10, 100)];
        assert_eq!(RegressionPolicy::trend_factor(&rising), 1.1);
        let falling = vec![s(10, 100), s(10, 200)];
        assert_eq!(RegressionPolicy::trend_factor(&falling), 0.9);
    }

    #[test]
    fn test_heuristic_high_pressure() {
        let p = HeuristicPolicy;
        let size = p
            .propose(&[], 100, &LoadSignal::new(0.95, 0.0, 0.0), (1, 1000))
            .unwrap();
        assert_eq!(size, 70);
    }
}
