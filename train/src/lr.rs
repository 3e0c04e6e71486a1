use std::f64::consts::PI;

use burn::{LearningRate, prelude::Config};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrSchedule {
    /// Always the base rate.
    Constant,
    /// Half cosine from the base rate down to zero over all epochs.
    Cosine,
    /// Multiply by `decay_gamma` at every milestone epoch reached.
    Step,
    /// Linear warmup from 10% of the base rate, then cosine decay over the remaining epochs.
    WarmupCosine,
}

#[derive(Config, Debug)]
pub struct LrConfig {
    #[config(default = "LrSchedule::WarmupCosine")]
    pub schedule: LrSchedule,

    /// Peak learning rate.
    #[config(default = 5e-4)]
    pub base_lr: f64,

    /// Length of the warmup in (fractional) epochs.
    #[config(default = 1.0)]
    pub warmup_epochs: f64,

    /// Decay factor of the step schedule.
    #[config(default = 0.1)]
    pub decay_gamma: f64,

    /// Epochs at which the step schedule decays.
    #[config(default = "Vec::new()")]
    pub milestones: Vec<f64>,
}

impl LrConfig {
    /// Learning rate for step `step` of `steps_per_epoch` in epoch `epoch`.
    ///
    /// This is a pure function of its arguments and never negative.
    pub fn learning_rate(
        &self,
        epoch: usize,
        total_epochs: usize,
        step: usize,
        steps_per_epoch: usize,
    ) -> LearningRate {
        let mut t = epoch as f64;
        if steps_per_epoch > 0 {
            t += step as f64 / steps_per_epoch as f64;
        }
        let total = total_epochs as f64;

        let mult = match self.schedule {
            LrSchedule::Constant => 1.0,
            LrSchedule::Cosine => cosine_mult(t, total),
            LrSchedule::Step => {
                let reached = self.milestones.iter().filter(|&&m| t >= m).count();
                self.decay_gamma.powi(reached as i32)
            }
            LrSchedule::WarmupCosine => {
                if t < self.warmup_epochs {
                    0.1 + 0.9 * t / self.warmup_epochs
                } else {
                    cosine_mult(t - self.warmup_epochs, total - self.warmup_epochs)
                }
            }
        };

        let lr = self.base_lr * mult;
        if lr > 0.0 { lr } else { 0.0 }
    }
}

fn cosine_mult(t: f64, span: f64) -> f64 {
    if span <= 0.0 {
        return 0.0;
    }
    let progress = (t / span).clamp(0.0, 1.0);
    0.5 * ((PI * progress).cos() + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_never_changes() {
        let config = LrConfig::new().with_schedule(LrSchedule::Constant);
        for epoch in 0..10 {
            for step in 0..7 {
                assert_eq!(config.learning_rate(epoch, 10, step, 7), 5e-4);
            }
        }
    }

    #[test]
    fn same_arguments_same_rate() {
        for schedule in [
            LrSchedule::Constant,
            LrSchedule::Cosine,
            LrSchedule::Step,
            LrSchedule::WarmupCosine,
        ] {
            let config = LrConfig::new()
                .with_schedule(schedule)
                .with_milestones(vec![2.0, 5.0]);
            let later = config.learning_rate(7, 10, 3, 9);
            let first = config.learning_rate(1, 10, 4, 9);
            assert_eq!(config.learning_rate(1, 10, 4, 9), first);
            assert_eq!(config.learning_rate(7, 10, 3, 9), later);
        }
    }

    #[test]
    fn cosine_decays_to_zero() {
        let config = LrConfig::new().with_schedule(LrSchedule::Cosine).with_base_lr(1.0);
        assert_eq!(config.learning_rate(0, 10, 0, 4), 1.0);
        assert!((config.learning_rate(5, 10, 0, 4) - 0.5).abs() < 1e-12);
        assert!(config.learning_rate(10, 10, 0, 4).abs() < 1e-12);

        let mut previous = f64::INFINITY;
        for epoch in 0..10 {
            for step in 0..4 {
                let lr = config.learning_rate(epoch, 10, step, 4);
                assert!(lr <= previous && lr >= 0.0);
                previous = lr;
            }
        }
    }

    #[test]
    fn step_decays_at_milestones() {
        let config = LrConfig::new()
            .with_schedule(LrSchedule::Step)
            .with_base_lr(1.0)
            .with_decay_gamma(0.5)
            .with_milestones(vec![2.0, 4.0]);
        assert_eq!(config.learning_rate(1, 6, 9, 10), 1.0);
        assert_eq!(config.learning_rate(2, 6, 0, 10), 0.5);
        assert_eq!(config.learning_rate(5, 6, 0, 10), 0.25);
    }

    #[test]
    fn warmup_ramps_then_decays() {
        let config = LrConfig::new()
            .with_schedule(LrSchedule::WarmupCosine)
            .with_base_lr(1.0)
            .with_warmup_epochs(2.0);
        assert!((config.learning_rate(0, 10, 0, 2) - 0.1).abs() < 1e-12);
        assert!((config.learning_rate(1, 10, 0, 2) - 0.55).abs() < 1e-12);
        assert_eq!(config.learning_rate(2, 10, 0, 2), 1.0);
        assert!(config.learning_rate(9, 10, 1, 2) < 0.05);
    }

    #[test]
    fn never_negative() {
        let config = LrConfig::new()
            .with_schedule(LrSchedule::Step)
            .with_decay_gamma(-0.5)
            .with_milestones(vec![0.0]);
        assert_eq!(config.learning_rate(3, 4, 0, 1), 0.0);

        let past_end = LrConfig::new().with_schedule(LrSchedule::Cosine);
        assert!(past_end.learning_rate(12, 10, 0, 1) >= 0.0);
    }
}
