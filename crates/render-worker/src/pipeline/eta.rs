//! Advisory time-remaining estimates.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: usize = 10;
const DEFAULT_STAGE_SECS: f64 = 30.0;

/// Estimates remaining time from recent progress of the active stage plus
/// the average duration of completed stages.
#[derive(Debug, Default)]
pub struct EtaEstimator {
    samples: VecDeque<(f64, Instant)>,
    completed: Vec<Duration>,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the sample window for a new stage.
    pub fn start_stage(&mut self) {
        self.samples.clear();
    }

    pub fn record(&mut self, percent: f64, at: Instant) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((percent.clamp(0.0, 100.0), at));
    }

    /// `active` excludes paused time.
    pub fn complete_stage(&mut self, active: Duration) {
        self.completed.push(active);
        self.samples.clear();
    }

    /// Seconds remaining, rounded up. `None` until the active stage has two
    /// samples with measurable progress.
    pub fn estimate(&self, remaining_stages: usize) -> Option<u64> {
        let (first_p, first_t) = *self.samples.front()?;
        let (last_p, last_t) = *self.samples.back()?;
        if self.samples.len() < 2 {
            return None;
        }

        let elapsed = last_t.saturating_duration_since(first_t).as_secs_f64();
        let progressed = last_p - first_p;
        if elapsed <= 0.0 || progressed <= 0.0 {
            return None;
        }

        let rate = progressed / elapsed;
        let current = (100.0 - last_p) / rate;
        let rest = remaining_stages as f64 * self.average_stage_secs();
        Some((current + rest).ceil() as u64)
    }

    fn average_stage_secs(&self) -> f64 {
        if self.completed.is_empty() {
            return DEFAULT_STAGE_SECS;
        }
        let total: f64 = self.completed.iter().map(Duration::as_secs_f64).sum();
        total / self.completed.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_two_samples() {
        let mut eta = EtaEstimator::new();
        assert_eq!(eta.estimate(0), None);
        eta.record(10.0, Instant::now());
        assert_eq!(eta.estimate(0), None);
    }

    #[test]
    fn test_rate_and_default_stage_duration() {
        let start = Instant::now();
        let mut eta = EtaEstimator::new();
        eta.record(0.0, start);
        eta.record(50.0, start + Duration::from_secs(10));

        // 5%/s with 50% left is 10s, plus one unknown stage at 30s.
        assert_eq!(eta.estimate(0), Some(10));
        assert_eq!(eta.estimate(1), Some(40));
    }

    #[test]
    fn test_completed_stages_drive_average() {
        let start = Instant::now();
        let mut eta = EtaEstimator::new();
        eta.complete_stage(Duration::from_secs(4));
        eta.complete_stage(Duration::from_secs(6));
        eta.start_stage();
        eta.record(20.0, start);
        eta.record(60.0, start + Duration::from_millis(1500));

        // 40/1.5s leaves 1.5s, plus 2 stages at 5s each.
        assert_eq!(eta.estimate(2), Some(12));
    }

    #[test]
    fn test_window_keeps_latest_samples() {
        let start = Instant::now();
        let mut eta = EtaEstimator::new();
        eta.record(0.0, start);
        for i in 1..=WINDOW as u64 {
            // Slow at first, then 10%/s over the kept window.
            eta.record(i as f64 * 10.0 - 5.0, start + Duration::from_secs(100 + i));
        }
        assert_eq!(eta.samples.len(), WINDOW);
        assert_eq!(eta.estimate(0), Some(1));
    }
}
