//! Colour space conversion between the model's luma/chroma triplet and RGB.
//!
//! The network works on a YUV-like encoding: channel 0 carries luma in
//! `[-1, 1]`, channels 1 and 2 carry chroma scaled by two so that they also
//! span roughly `[-1, 1]`. Coefficients follow Kornia's `yuv_to_rgb` and
//! `rgb_to_yuv`.

use alloc::vec;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor};

use crate::error::{DiffusionError, Result};

/// Rescales `tensor` into `[0, 1]` using its global minimum and maximum.
///
/// A constant tensor maps to zeros.
pub fn scale_0_and_1<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    let min: f64 = tensor.clone().min().into_scalar().elem();
    let max: f64 = tensor.clone().max().into_scalar().elem();
    let range = max - min;

    if range > 0.0 {
        tensor.sub_scalar(min).div_scalar(range)
    } else {
        Tensor::zeros(tensor.shape(), &tensor.device())
    }
}

/// Maps values from `[-1, 1]` into `[0, 1]`, clamping anything outside.
pub fn to_unit_range<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    tensor.clamp(-1.0, 1.0).add_scalar(1.0).div_scalar(2.0)
}

/// Converts a model tensor into displayable RGB values in `[0, 1]`.
///
/// Accepts 3 channels, or 4 channels where the leading one is ignored.
pub fn yuv_to_rgb<B: Backend>(tensor: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
    let [batch, channels, height, width] = tensor.dims();
    if batch * height * width == 0 {
        return Err(DiffusionError::EmptyBatch);
    }
    let offset = match channels {
        3 => 0,
        4 => 1,
        _ => {
            return Err(DiffusionError::ShapeMismatch {
                what: "colour channels",
                expected: 3,
                actual: channels,
            })
        }
    };
    let channel = |index: usize| {
        let start = offset + index;
        tensor
            .clone()
            .slice([0..batch, start..start + 1, 0..height, 0..width])
    };

    let y = scale_0_and_1(channel(0));
    // Chroma goes through [0, 1] and back to a zero-centred range.
    let u = to_unit_range(channel(1)).sub_scalar(0.5);
    let v = to_unit_range(channel(2)).sub_scalar(0.5);

    let r = y.clone() + v.clone().mul_scalar(1.14);
    let g = y.clone() - u.clone().mul_scalar(0.396) - v.mul_scalar(0.581);
    let b = y + u.mul_scalar(2.029);

    Ok(scale_0_and_1(Tensor::cat(vec![r, g, b], 1)))
}

/// Same as [yuv_to_rgb](yuv_to_rgb) but scaled to `[0, 255]` and truncated.
pub fn yuv_to_rgb8<B: Backend>(tensor: Tensor<B, 4>) -> Result<Tensor<B, 4, Int>> {
    Ok(yuv_to_rgb(tensor)?.mul_scalar(255.0).int())
}

/// Converts RGB values in `[0, 1]` into the model's luma/chroma triplet.
pub fn rgb_to_yuv<B: Backend>(rgb: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
    let [batch, channels, height, width] = rgb.dims();
    if channels != 3 {
        return Err(DiffusionError::ShapeMismatch {
            what: "colour channels",
            expected: 3,
            actual: channels,
        });
    }
    let channel = |index: usize| {
        rgb.clone()
            .slice([0..batch, index..index + 1, 0..height, 0..width])
    };
    let (r, g, b) = (channel(0), channel(1), channel(2));

    let y = r.clone().mul_scalar(0.299) + g.clone().mul_scalar(0.587) + b.clone().mul_scalar(0.114);
    let u = r.clone().mul_scalar(-0.147) - g.clone().mul_scalar(0.289) + b.clone().mul_scalar(0.436);
    let v = r.mul_scalar(0.615) - g.mul_scalar(0.515) - b.mul_scalar(0.100);

    Ok(Tensor::cat(
        vec![y.mul_scalar(2.0).sub_scalar(1.0), u.mul_scalar(2.0), v.mul_scalar(2.0)],
        1,
    ))
}
