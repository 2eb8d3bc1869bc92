//! # Models
//!
//! Capabilities the diffusion loop expects from its networks, and the
//! exponential moving average kept alongside the denoising network.

pub mod ema;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::error::DiffusionError;

/// A network predicting the noise contained in a noised image batch.
///
/// Outputs must have the shape of `x`. Errors produced by the network are
/// returned unchanged by the samplers, which is why the error type has to
/// absorb [DiffusionError](DiffusionError).
pub trait NoisePredictor<B: Backend> {
    type Error: From<DiffusionError>;

    /// Predicts the noise of `x` at `timesteps`.
    ///
    /// - x: `[batch, channels, height, width]`
    /// - timesteps: `[batch]`
    /// - conditioning: `[batch, embedding]`, `None` for an unconditional query
    fn predict_noise(
        &self,
        x: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
        conditioning: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 4>, Self::Error>;

    /// Whether the network accepts `conditioning = None`.
    fn supports_unconditional(&self) -> bool {
        true
    }
}

impl<B: Backend, N: NoisePredictor<B>> NoisePredictor<B> for &N {
    type Error = N::Error;

    fn predict_noise(
        &self,
        x: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
        conditioning: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 4>, Self::Error> {
        (**self).predict_noise(x, timesteps, conditioning)
    }

    fn supports_unconditional(&self) -> bool {
        (**self).supports_unconditional()
    }
}

/// A network embedding a reference frame into the conditioning vector.
pub trait FeatureExtractor<B: Backend> {
    type Error;

    /// Embeds `[batch, channels, height, width]` images into `[batch, embedding]`.
    fn embed(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>, Self::Error>;
}

/// Adapts a closure into a [NoisePredictor](NoisePredictor).
#[derive(Debug, Clone)]
pub struct PredictorFn<F> {
    predict: F,
    unconditional: bool,
}

impl<F> PredictorFn<F> {
    pub fn new(predict: F) -> Self {
        Self {
            predict,
            unconditional: true,
        }
    }

    /// Marks the wrapped network as conditional only.
    pub fn conditional_only(mut self) -> Self {
        self.unconditional = false;
        self
    }
}

impl<B, F, E> NoisePredictor<B> for PredictorFn<F>
where
    B: Backend,
    F: Fn(Tensor<B, 4>, Tensor<B, 1, Int>, Option<Tensor<B, 2>>) -> Result<Tensor<B, 4>, E>,
    E: From<DiffusionError>,
{
    type Error = E;

    fn predict_noise(
        &self,
        x: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
        conditioning: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 4>, E> {
        (self.predict)(x, timesteps, conditioning)
    }

    fn supports_unconditional(&self) -> bool {
        self.unconditional
    }
}
