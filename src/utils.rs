use burn::tensor::backend::Backend;
use burn::tensor::{Data, ElementConversion, Int, Shape, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

pub mod color;
pub mod frames;

/// Draws a tensor of i.i.d. standard-normal values from `rng`.
///
/// Values are sampled on the host so that a seeded generator gives the same
/// tensor on every backend.
pub fn randn<B: Backend, const D: usize, R: Rng>(
    dims: [usize; D],
    device: &B::Device,
    rng: &mut R,
) -> Tensor<B, D> {
    let num_elements = dims.iter().product();
    let values: Vec<B::FloatElem> = (0..num_elements)
        .map(|_| {
            let value: f64 = StandardNormal.sample(rng);
            value.elem()
        })
        .collect();

    Tensor::from_data(Data::new(values, Shape::new(dims)), device)
}

/// Builds the integer timestep batch handed to a denoising network.
pub fn timesteps_tensor<B: Backend>(timesteps: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<B::IntElem> = timesteps.iter().map(|&t| (t as i64).elem()).collect();

    Tensor::from_data(Data::new(values, Shape::new([timesteps.len()])), device)
}

/// Lays out one scalar per batch element as a `[batch, 1, 1, 1]` tensor so it
/// broadcasts over an image batch.
pub(crate) fn batch_coefficients<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 4> {
    let data: Vec<B::FloatElem> = values.iter().map(|v| v.elem()).collect();

    Tensor::from_data(Data::new(data, Shape::new([values.len(), 1, 1, 1])), device)
}
