//! Adaptive batch size from a rolling performance score.
//!
//! `score = 0.4 * time + 0.3 * memory + 0.3 * success`, each component in `[0, 1]`:
//! - time is 1 up to the reference batch duration, then decays as `reference / wall`;
//! - memory is 1 inside the target utilisation band and falls off on both sides;
//! - success is the batch success fraction.
//!
//! Once enough samples exist, the latest score is compared with the oldest in the window:
//! improving and above the high-water mark steps up, degrading and below the low-water mark
//! steps down. One step per adaptation, always clamped to `[min, max]`.

use log::debug;
use std::collections::VecDeque;

use crate::types::BatchMetrics;
use crate::utils::config::{BatchConsts, BatchSizeRange};

#[derive(Debug)]
pub struct AdaptiveBatchSizer {
    range: BatchSizeRange,
    current: usize,
    window: VecDeque<(BatchMetrics, f64)>,
    capacity: usize,
}

impl AdaptiveBatchSizer {
    pub fn new(range: BatchSizeRange) -> Self {
        Self::with_window(range, BatchConsts::WINDOW)
    }

    pub fn with_window(range: BatchSizeRange, capacity: usize) -> Self {
        let min = range.min.max(1);
        let max = range.max.max(min);
        let range = BatchSizeRange {
            min,
            max,
            step: range.step.max(1),
            initial: range.initial.clamp(min, max),
        };
        Self {
            range,
            current: range.initial,
            window: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
        }
    }

    pub fn next_batch_size(&self) -> usize {
        self.current
    }

    pub fn range(&self) -> BatchSizeRange {
        self.range
    }

    /// Scores in the window, oldest first.
    pub fn scores(&self) -> Vec<f64> {
        self.window.iter().map(|(_, s)| *s).collect()
    }

    /// Add one batch's metrics, rescore and maybe move one step. Returns the new size.
    pub fn record_outcome(&mut self, metrics: BatchMetrics) -> usize {
        let score = score(&metrics);
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back((metrics, score));

        if self.window.len() < BatchConsts::MIN_SAMPLES {
            return self.current;
        }
        let (Some((_, oldest)), Some((_, latest))) = (self.window.front(), self.window.back())
        else {
            return self.current;
        };
        let (oldest, latest) = (*oldest, *latest);
        let before = self.current;
        if latest >= oldest && latest > BatchConsts::HIGH_WATER {
            self.current = (self.current + self.range.step).min(self.range.max);
        } else if latest < oldest && latest < BatchConsts::LOW_WATER {
            self.current = self
                .current
                .saturating_sub(self.range.step)
                .max(self.range.min);
        }
        if self.current != before {
            debug!(
                "batch size {} -> {} (score {:.2}, oldest {:.2})",
                before, self.current, latest, oldest
            );
        }
        self.current
    }

    /// Step down once regardless of the score trend (memory pressure).
    pub fn force_decrease(&mut self) -> usize {
        let before = self.current;
        self.current = self
            .current
            .saturating_sub(self.range.step)
            .max(self.range.min);
        if self.current != before {
            debug!("batch size {} -> {} (memory pressure)", before, self.current);
        }
        self.current
    }
}

fn time_score(wall_secs: f64) -> f64 {
    let reference = BatchConsts::REFERENCE_BATCH_SECS;
    if wall_secs <= reference {
        1.0
    } else {
        reference / wall_secs
    }
}

fn memory_score(fraction: f64) -> f64 {
    let (low, high) = BatchConsts::MEMORY_BAND;
    let f = fraction.clamp(0.0, 1.0);
    if f < low {
        0.5 + 0.5 * f / low
    } else if f <= high {
        1.0
    } else {
        ((1.0 - f) / (1.0 - high)).max(0.0)
    }
}

/// Weighted performance score of one batch, in `[0, 1]`.
pub fn score(m: &BatchMetrics) -> f64 {
    BatchConsts::TIME_WEIGHT * time_score(m.wall_time_secs)
        + BatchConsts::MEMORY_WEIGHT * memory_score(m.memory_fraction)
        + BatchConsts::SUCCESS_WEIGHT * m.success_rate()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: usize, max: usize, step: usize, initial: usize) -> BatchSizeRange {
        BatchSizeRange {
            min,
            max,
            step,
            initial,
        }
    }

    fn good() -> BatchMetrics {
        BatchMetrics {
            batch_size: 8,
            wall_time_secs: 1.0,
            memory_fraction: 0.5,
            success_count: 8,
            failure_count: 0,
        }
    }

    fn bad(wall: f64) -> BatchMetrics {
        BatchMetrics {
            batch_size: 8,
            wall_time_secs: wall,
            memory_fraction: 0.97,
            success_count: 1,
            failure_count: 7,
        }
    }

    #[test]
    fn component_scores() {
        assert_eq!(time_score(10.0), 1.0);
        assert!((time_score(60.0) - 0.5).abs() < 1e-9);
        assert_eq!(memory_score(0.5), 1.0);
        assert!(memory_score(0.1) < 1.0 && memory_score(0.1) > 0.5);
        assert!(memory_score(0.95) < 0.2);
        assert!((score(&good()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn waits_for_three_samples_then_steps_once_per_outcome() {
        let mut s = AdaptiveBatchSizer::new(range(1, 20, 4, 8));
        assert_eq!(s.record_outcome(good()), 8);
        assert_eq!(s.record_outcome(good()), 8);
        assert_eq!(s.record_outcome(good()), 12);
        assert_eq!(s.record_outcome(good()), 16);
        assert_eq!(s.record_outcome(good()), 20);
        assert_eq!(s.record_outcome(good()), 20);
    }

    #[test]
    fn degrading_scores_step_down_to_min() {
        let mut s = AdaptiveBatchSizer::new(range(2, 20, 4, 8));
        s.record_outcome(good());
        s.record_outcome(bad(40.0));
        assert_eq!(s.record_outcome(bad(50.0)), 4);
        assert_eq!(s.record_outcome(bad(60.0)), 2);
        assert_eq!(s.record_outcome(bad(70.0)), 2);
    }

    #[test]
    fn never_leaves_bounds() {
        let mut s = AdaptiveBatchSizer::with_window(range(3, 9, 5, 100), 4);
        assert_eq!(s.next_batch_size(), 9);
        for i in 0..50 {
            let m = if i % 3 == 0 { bad(i as f64 * 10.0) } else { good() };
            let n = s.record_outcome(m);
            assert!((3..=9).contains(&n));
        }
        for _ in 0..5 {
            assert!(s.force_decrease() >= 3);
        }
        assert_eq!(s.next_batch_size(), 3);
    }
}
