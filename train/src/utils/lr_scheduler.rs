use crate::{common::*, config::LearningRatePolicy};

/// Computes the learning rate of each iteration.
#[derive(Debug, Clone)]
pub enum LrScheduler {
    Fixed {
        base_lr: f64,
    },
    Step {
        base_lr: f64,
        gamma: f64,
        step_size: usize,
    },
    MultiStep {
        base_lr: f64,
        gamma: f64,
        step_values: Vec<usize>,
    },
}

impl LrScheduler {
    pub fn new(config: &LearningRatePolicy) -> Result<Self> {
        let scheduler = match *config {
            LearningRatePolicy::Fixed { base_lr } => {
                ensure!(base_lr >= 0.0, "the base_lr must be non-negative");
                Self::Fixed {
                    base_lr: base_lr.raw(),
                }
            }
            LearningRatePolicy::Step {
                base_lr,
                gamma,
                step_size,
            } => {
                ensure!(base_lr >= 0.0, "the base_lr must be non-negative");
                ensure!(gamma > 0.0, "the gamma must be positive");
                Self::Step {
                    base_lr: base_lr.raw(),
                    gamma: gamma.raw(),
                    step_size: step_size.get(),
                }
            }
            LearningRatePolicy::MultiStep {
                base_lr,
                gamma,
                ref step_values,
            } => {
                ensure!(base_lr >= 0.0, "the base_lr must be non-negative");
                ensure!(gamma > 0.0, "the gamma must be positive");
                ensure!(
                    step_values.iter().tuple_windows().all(|(prev, next)| prev < next),
                    "the step_values must be monotonic"
                );
                Self::MultiStep {
                    base_lr: base_lr.raw(),
                    gamma: gamma.raw(),
                    step_values: step_values.clone(),
                }
            }
        };

        Ok(scheduler)
    }

    /// The learning rate used to update parameters at `iter`.
    pub fn lr(&self, iter: usize) -> f64 {
        match *self {
            Self::Fixed { base_lr } => base_lr,
            Self::Step {
                base_lr,
                gamma,
                step_size,
            } => base_lr * gamma.powi((iter / step_size) as i32),
            Self::MultiStep {
                base_lr,
                gamma,
                ref step_values,
            } => {
                let num_passed = step_values.partition_point(|&step| step <= iter);
                base_lr * gamma.powi(num_passed as i32)
            }
        }
    }
}
