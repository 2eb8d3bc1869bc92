use burn::tensor::{backend::Backend, Tensor};

/// Classifier-free guidance: `uncond + scale * (cond - uncond)`.
///
/// A scale of 1 returns the conditional prediction, larger values push the
/// result further away from the unconditional one.
pub fn cfg<B: Backend, const D: usize>(
    cond: Tensor<B, D>,
    uncond: Tensor<B, D>,
    scale: f64,
) -> Tensor<B, D> {
    uncond.clone() + (cond - uncond).mul_scalar(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::Data;

    #[test]
    fn test_cfg_interpolates_and_extrapolates() {
        let device = <TestBackend as Backend>::Device::default();
        let cond: Tensor<TestBackend, 1> = Tensor::from_floats([1.0, 2.0], &device);
        let uncond: Tensor<TestBackend, 1> = Tensor::from_floats([0.0, 4.0], &device);

        cfg(cond.clone(), uncond.clone(), 0.0)
            .to_data()
            .assert_approx_eq(&Data::from([0.0, 4.0]), 5);
        cfg(cond.clone(), uncond.clone(), 1.0)
            .to_data()
            .assert_approx_eq(&Data::from([1.0, 2.0]), 5);
        cfg(cond, uncond, 3.0)
            .to_data()
            .assert_approx_eq(&Data::from([3.0, -2.0]), 5);
    }
}
