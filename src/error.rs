use thiserror::Error;

pub type Result<T> = core::result::Result<T, DiffusionError>;

/// Errors raised by the diffusion core.
#[derive(Debug, Error)]
pub enum DiffusionError {
    #[error("invalid noise schedule: {0}")]
    InvalidSchedule(String),

    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{what} has shape {actual:?}, expected {expected:?}")]
    UnexpectedShape {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("cannot process an empty batch")]
    EmptyBatch,

    #[error("timestep {timestep} is outside of the schedule (noise steps: {noise_steps})")]
    TimestepOutOfRange { timestep: usize, noise_steps: usize },

    #[error("guidance scale {0} requested but the network has no unconditional path")]
    UnsupportedGuidance(f64),

    #[error("sampling cancelled at timestep {timestep}")]
    Cancelled { timestep: usize },

    #[error("parameter mismatch between shadow and live model: {0}")]
    ParameterMismatch(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
