//! # Pipelines
//!
//! Sampling and training entry points tying a noise schedule to a denoising
//! network.

pub mod colorization;
pub mod guidance;
