//! # Reference-guided video colorization with diffusion
//!
//! A denoising diffusion probabilistic model colorizing grayscale frames,
//! conditioned on an embedding of a reference colour frame, built with
//! [Burn](https://github.com/burn-rs/burn).
//!
//! The crate provides the noise schedule and forward process
//! ([schedulers::ddpm]), the reverse sampling loop with classifier-free
//! guidance ([pipelines::colorization]), the colour space conversion
//! ([utils::color]) and the EMA shadow model ([models::ema]). Networks are
//! supplied by the caller through [models::NoisePredictor] and
//! [models::FeatureExtractor].

extern crate alloc;

pub mod checkpoint;
pub mod error;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod utils;

pub use error::{DiffusionError, Result};

#[cfg(test)]
use burn::backend::ndarray;

#[cfg(test)]
pub type TestBackend = ndarray::NdArray<f32>;
