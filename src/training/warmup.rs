//! Warmup schedule for the consistency term.

use serde::{Deserialize, Serialize};

/// Linear ramp from 0 to 1 over the first `warmup_pos` fraction of
/// training, saturating at 1 for the remainder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupSchedule {
    /// Fraction of total training at which the ramp reaches 1
    warmup_pos: f64,
    /// Total optimizer steps in the run
    total_steps: u64,
}

impl WarmupSchedule {
    pub fn new(warmup_pos: f64, total_steps: u64) -> Self {
        Self {
            warmup_pos,
            total_steps,
        }
    }

    /// Weight for the given global step: `clamp(step / (warmup_pos *
    /// total_steps), 0, 1)`.
    pub fn weight(&self, step: u64) -> f64 {
        let denominator = self.warmup_pos * self.total_steps as f64;
        if denominator <= 0.0 {
            return 1.0;
        }
        (step as f64 / denominator).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_zero() {
        let schedule = WarmupSchedule::new(0.4, 1000);
        assert_eq!(schedule.weight(0), 0.0);
    }

    #[test]
    fn test_saturates_at_one() {
        let schedule = WarmupSchedule::new(0.4, 1000);
        assert_eq!(schedule.weight(400), 1.0);
        assert_eq!(schedule.weight(401), 1.0);
        assert_eq!(schedule.weight(1000), 1.0);
        assert_eq!(schedule.weight(100_000), 1.0);
    }

    #[test]
    fn test_linear_in_between() {
        let schedule = WarmupSchedule::new(0.5, 1000);
        assert!((schedule.weight(250) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_monotonic() {
        let schedule = WarmupSchedule::new(0.4, 1000);
        let mut previous = -1.0;
        for step in 0..1200 {
            let weight = schedule.weight(step);
            assert!(weight >= previous);
            previous = weight;
        }
    }

    #[test]
    fn test_degenerate_denominator() {
        let schedule = WarmupSchedule::new(0.4, 0);
        assert_eq!(schedule.weight(0), 1.0);
    }
}
