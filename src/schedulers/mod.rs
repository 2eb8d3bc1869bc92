pub mod ddpm;

use serde::{Deserialize, Serialize};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
}

impl BetaSchedule {
    /// Returns `num_steps` betas going from `start` to `end`, both included.
    pub fn betas(&self, start: f64, end: f64, num_steps: usize) -> Vec<f64> {
        match self {
            BetaSchedule::Linear => linspace(start, end, num_steps),
            BetaSchedule::ScaledLinear => linspace(start.sqrt(), end.sqrt(), num_steps)
                .into_iter()
                .map(|beta| beta * beta)
                .collect(),
        }
    }
}

/// Evenly spaced values over `[start, end]`.
fn linspace(start: f64, end: f64, num_steps: usize) -> Vec<f64> {
    match num_steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step_size = (end - start) / (num_steps - 1) as f64;
            (0..num_steps)
                .map(|i| start + step_size * i as f64)
                .collect()
        }
    }
}
