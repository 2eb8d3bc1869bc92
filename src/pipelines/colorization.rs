//! Reference-guided colorization with a denoising diffusion model.
//!
//! Frames are encoded as a luma/chroma triplet (see [color](crate::utils::color)).
//! The denoising network is conditioned on an embedding of a reference
//! colour frame and trained to predict the chroma part of the noise.

use std::sync::atomic::{AtomicBool, Ordering};

use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use rand::Rng;

use super::guidance::cfg;
use crate::error::DiffusionError;
use crate::models::{FeatureExtractor, NoisePredictor};
use crate::schedulers::ddpm::DDPMScheduler;
use crate::utils::color::{yuv_to_rgb, yuv_to_rgb8};
use crate::utils::{randn, timesteps_tensor};

/// Parameters of one reverse-sampling call.
#[derive(Debug, Clone)]
pub struct SampleRequest<'a, B: Backend> {
    pub batch_size: usize,
    pub channels: usize,
    /// `[batch_size, embedding]`; `None` samples unconditionally.
    pub conditioning: Option<Tensor<B, 2>>,
    /// Classifier-free guidance scale, `0` disables guidance.
    pub guidance_scale: f64,
    /// Checked once per timestep; sampling stops when it becomes `true`.
    pub cancel: Option<&'a AtomicBool>,
}

impl<'a, B: Backend> SampleRequest<'a, B> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            channels: 3,
            conditioning: None,
            guidance_scale: 0.0,
            cancel: None,
        }
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_conditioning(mut self, conditioning: Tensor<B, 2>) -> Self {
        self.conditioning = Some(conditioning);
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub struct ColorizationPipeline<B: Backend> {
    scheduler: DDPMScheduler<B>,
    device: B::Device,
}

impl<B: Backend> ColorizationPipeline<B> {
    pub fn new(scheduler: DDPMScheduler<B>, device: B::Device) -> Self {
        Self { scheduler, device }
    }

    pub fn scheduler(&self) -> &DDPMScheduler<B> {
        &self.scheduler
    }

    /// Runs the reverse diffusion chain and returns the raw model tensor.
    ///
    /// The network is queried once per timestep from `noise_steps - 1` down to
    /// 1, twice when guidance is enabled. It has to be in inference mode, i.e.
    /// a module on a non-autodiff backend (see `AutodiffModule::valid`).
    pub fn sample<N, R>(
        &self,
        network: &N,
        request: SampleRequest<'_, B>,
        rng: &mut R,
    ) -> Result<Tensor<B, 4>, N::Error>
    where
        N: NoisePredictor<B>,
        R: Rng,
    {
        let SampleRequest {
            batch_size,
            channels,
            conditioning,
            guidance_scale,
            cancel,
        } = request;

        if batch_size == 0 {
            return Err(DiffusionError::EmptyBatch.into());
        }
        let guided = guidance_scale > 0.0;
        if guided && !network.supports_unconditional() {
            return Err(DiffusionError::UnsupportedGuidance(guidance_scale).into());
        }
        if let Some(conditioning) = &conditioning {
            check_batch("conditioning batch", batch_size, conditioning.dims()[0])?;
        }

        tracing::info!(batch_size, guidance_scale, "sampling {batch_size} new images");
        let size = self.scheduler.image_size();
        let mut x = randn::<B, 4, R>([batch_size, channels, size, size], &self.device, rng);

        for &timestep in self.scheduler.timesteps() {
            if cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                tracing::warn!(timestep, "sampling cancelled");
                return Err(DiffusionError::Cancelled { timestep }.into());
            }

            let t: Tensor<B, 1, Int> = timesteps_tensor(&vec![timestep; batch_size], &self.device);
            let mut predicted_noise =
                network.predict_noise(x.clone(), t.clone(), conditioning.clone())?;
            check_shape("predicted noise", x.dims(), predicted_noise.dims())?;
            if guided {
                let uncond_predicted_noise = network.predict_noise(x.clone(), t, None)?;
                check_shape(
                    "unconditional predicted noise",
                    x.dims(),
                    uncond_predicted_noise.dims(),
                )?;
                predicted_noise = cfg(predicted_noise, uncond_predicted_noise, guidance_scale);
            }

            x = self.scheduler.step(predicted_noise, timestep, x, rng)?;
            tracing::trace!(timestep, "denoising step done");
        }

        Ok(x)
    }

    /// Samples and converts the result to RGB in `[0, 1]`.
    pub fn sample_images<N, R>(
        &self,
        network: &N,
        request: SampleRequest<'_, B>,
        rng: &mut R,
    ) -> Result<Tensor<B, 4>, N::Error>
    where
        N: NoisePredictor<B>,
        R: Rng,
    {
        let x = self.sample(network, request, rng)?;
        Ok(yuv_to_rgb(x)?)
    }

    /// Samples and converts the result to 8-bit RGB values.
    pub fn sample_rgb8<N, R>(
        &self,
        network: &N,
        request: SampleRequest<'_, B>,
        rng: &mut R,
    ) -> Result<Tensor<B, 4, Int>, N::Error>
    where
        N: NoisePredictor<B>,
        R: Rng,
    {
        let x = self.sample(network, request, rng)?;
        Ok(yuv_to_rgb8(x)?)
    }

    /// Loss of one training minibatch.
    ///
    /// Noises `color_images` at random timesteps and compares the predicted
    /// noise with the drawn one on the two chroma channels.
    pub fn training_loss<N, R>(
        &self,
        network: &N,
        color_images: Tensor<B, 4>,
        labels: Option<Tensor<B, 2>>,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>, N::Error>
    where
        N: NoisePredictor<B>,
        R: Rng,
    {
        let [batch_size, channels, height, width] = color_images.dims();
        if batch_size == 0 {
            return Err(DiffusionError::EmptyBatch.into());
        }
        if channels < 3 {
            return Err(DiffusionError::ShapeMismatch {
                what: "training channels",
                expected: 3,
                actual: channels,
            }
            .into());
        }
        if let Some(labels) = &labels {
            check_batch("label batch", batch_size, labels.dims()[0])?;
        }

        let device = color_images.device();
        let timesteps = self.scheduler.sample_timesteps(batch_size, rng);
        let (x_t, noise) = self.scheduler.noise_images(color_images, &timesteps, rng)?;
        let shape = x_t.dims();
        let predicted_noise =
            network.predict_noise(x_t, timesteps_tensor(&timesteps, &device), labels)?;
        check_shape("predicted noise", shape, predicted_noise.dims())?;

        let channel = |tensor: &Tensor<B, 4>, index: usize| {
            tensor
                .clone()
                .slice([0..batch_size, index..index + 1, 0..height, 0..width])
        };
        let mse = MseLoss::new();
        let loss_u = mse.forward(channel(&predicted_noise, 1), channel(&noise, 1), Reduction::Mean);
        let loss_v = mse.forward(channel(&predicted_noise, 2), channel(&noise, 2), Reduction::Mean);

        Ok(loss_u + loss_v)
    }

    /// Embeds `reference_frames` with `features` and returns the minibatch loss.
    pub fn training_loss_with_features<N, F, R>(
        &self,
        network: &N,
        features: &F,
        reference_frames: Tensor<B, 4>,
        color_images: Tensor<B, 4>,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>, N::Error>
    where
        N: NoisePredictor<B>,
        F: FeatureExtractor<B, Error = N::Error>,
        R: Rng,
    {
        let labels = features.embed(reference_frames)?;
        self.training_loss(network, color_images, Some(labels), rng)
    }
}

fn check_batch(what: &'static str, expected: usize, actual: usize) -> Result<(), DiffusionError> {
    if expected != actual {
        return Err(DiffusionError::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }

    Ok(())
}

fn check_shape(
    what: &'static str,
    expected: [usize; 4],
    actual: [usize; 4],
) -> Result<(), DiffusionError> {
    if expected != actual {
        return Err(DiffusionError::UnexpectedShape {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PredictorFn;
    use crate::schedulers::ddpm::DDPMSchedulerConfig;
    use crate::TestBackend;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::{Cell, RefCell};

    type TB = TestBackend;

    fn device() -> <TB as Backend>::Device {
        Default::default()
    }

    fn pipeline(noise_steps: usize, image_size: usize) -> ColorizationPipeline<TB> {
        let config = DDPMSchedulerConfig::new()
            .with_noise_steps(noise_steps)
            .with_image_size(image_size);
        ColorizationPipeline::new(DDPMScheduler::new(config).unwrap(), device())
    }

    fn labels(batch_size: usize) -> Tensor<TB, 2> {
        Tensor::ones([batch_size, 4], &device())
    }

    /// Predicts `scale * x` and records how it was queried.
    #[derive(Default)]
    struct RecordingNetwork {
        scale: f64,
        conditional_calls: Cell<usize>,
        unconditional_calls: Cell<usize>,
        timesteps: RefCell<Vec<i64>>,
        last_input: RefCell<Option<Tensor<TB, 4>>>,
    }

    impl NoisePredictor<TB> for RecordingNetwork {
        type Error = DiffusionError;

        fn predict_noise(
            &self,
            x: Tensor<TB, 4>,
            timesteps: Tensor<TB, 1, Int>,
            conditioning: Option<Tensor<TB, 2>>,
        ) -> Result<Tensor<TB, 4>, DiffusionError> {
            let calls = match conditioning {
                Some(_) => &self.conditional_calls,
                None => &self.unconditional_calls,
            };
            calls.set(calls.get() + 1);
            self.timesteps
                .borrow_mut()
                .extend(timesteps.into_data().convert::<i64>().value);
            *self.last_input.borrow_mut() = Some(x.clone());

            Ok(x.mul_scalar(self.scale))
        }
    }

    struct ConditionalOnly;

    impl NoisePredictor<TB> for ConditionalOnly {
        type Error = DiffusionError;

        fn predict_noise(
            &self,
            x: Tensor<TB, 4>,
            _timesteps: Tensor<TB, 1, Int>,
            _conditioning: Option<Tensor<TB, 2>>,
        ) -> Result<Tensor<TB, 4>, DiffusionError> {
            Ok(x.zeros_like())
        }

        fn supports_unconditional(&self) -> bool {
            false
        }
    }

    #[derive(Debug)]
    enum NetworkError {
        Exploded(usize),
        Core(DiffusionError),
    }

    impl From<DiffusionError> for NetworkError {
        fn from(err: DiffusionError) -> Self {
            NetworkError::Core(err)
        }
    }

    struct FailingNetwork {
        calls: Cell<usize>,
    }

    impl NoisePredictor<TB> for FailingNetwork {
        type Error = NetworkError;

        fn predict_noise(
            &self,
            x: Tensor<TB, 4>,
            _timesteps: Tensor<TB, 1, Int>,
            _conditioning: Option<Tensor<TB, 2>>,
        ) -> Result<Tensor<TB, 4>, NetworkError> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() == 3 {
                return Err(NetworkError::Exploded(3));
            }
            Ok(x.zeros_like())
        }
    }

    struct MeanFeatures;

    impl FeatureExtractor<TB> for MeanFeatures {
        type Error = DiffusionError;

        fn embed(&self, images: Tensor<TB, 4>) -> Result<Tensor<TB, 2>, DiffusionError> {
            let [batch_size, channels, height, width] = images.dims();
            Ok(images.reshape([batch_size, channels * height * width]).mean_dim(1))
        }
    }

    #[test]
    fn test_no_guidance_never_queries_unconditionally() {
        let pipeline = pipeline(10, 4);
        let network = RecordingNetwork::default();
        let request = SampleRequest::new(2).with_conditioning(labels(2));

        let x = pipeline
            .sample(&network, request, &mut StdRng::seed_from_u64(1))
            .unwrap();

        assert_eq!(x.dims(), [2, 3, 4, 4]);
        assert_eq!(network.conditional_calls.get(), 9);
        assert_eq!(network.unconditional_calls.get(), 0);
        let expected: Vec<i64> = (1..10).rev().flat_map(|t| [t, t]).collect();
        assert_eq!(*network.timesteps.borrow(), expected);
    }

    #[test]
    fn test_guidance_queries_twice_per_timestep() {
        let pipeline = pipeline(10, 4);
        let network = RecordingNetwork::default();
        let request = SampleRequest::new(2)
            .with_conditioning(labels(2))
            .with_guidance_scale(3.0);

        pipeline
            .sample(&network, request, &mut StdRng::seed_from_u64(1))
            .unwrap();

        assert_eq!(network.conditional_calls.get(), 9);
        assert_eq!(network.unconditional_calls.get(), 9);
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let pipeline = pipeline(50, 4);
        let network = RecordingNetwork {
            scale: 0.1,
            ..Default::default()
        };
        let run = |seed| {
            let request = SampleRequest::new(2).with_conditioning(labels(2));
            pipeline
                .sample(&network, request, &mut StdRng::seed_from_u64(seed))
                .unwrap()
                .into_data()
        };

        let first = run(2023);
        let second = run(2023);
        let other = run(2024);

        assert_eq!(first.value, second.value);
        assert_ne!(first.value, other.value);
    }

    #[test]
    fn test_zero_noise_network_stays_bounded() {
        let pipeline = pipeline(500, 8);
        let network = RecordingNetwork::default();

        let x = pipeline
            .sample(&network, SampleRequest::new(2), &mut StdRng::seed_from_u64(7))
            .unwrap();

        assert_eq!(x.dims(), [2, 3, 8, 8]);
        let values = x.clone().into_data().value;
        assert!(values.iter().all(|v| v.is_finite() && v.abs() < 1e3));

        // The last update only rescales its input, no fresh noise is added.
        let last_input = network.last_input.borrow().clone().unwrap();
        let expected = last_input.mul_scalar(1.0 / pipeline.scheduler().alpha(1).sqrt());
        x.to_data().assert_approx_eq(&expected.to_data(), 4);
    }

    #[test]
    fn test_guidance_requires_unconditional_path() {
        let pipeline = pipeline(10, 4);
        let request = SampleRequest::new(1)
            .with_conditioning(labels(1))
            .with_guidance_scale(2.0);

        let result = pipeline.sample(&ConditionalOnly, request, &mut StdRng::seed_from_u64(1));

        assert!(matches!(result, Err(DiffusionError::UnsupportedGuidance(_))));
        assert!(pipeline
            .sample(&ConditionalOnly, SampleRequest::new(1), &mut StdRng::seed_from_u64(1))
            .is_ok());
    }

    #[test]
    fn test_conditioning_batch_must_match() {
        let pipeline = pipeline(10, 4);
        let request = SampleRequest::new(2).with_conditioning(labels(3));

        let result = pipeline.sample(
            &RecordingNetwork::default(),
            request,
            &mut StdRng::seed_from_u64(1),
        );

        assert!(matches!(
            result,
            Err(DiffusionError::ShapeMismatch { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn test_reshaped_prediction_is_rejected() {
        let pipeline = pipeline(10, 4);
        let network = PredictorFn::new(
            |x: Tensor<TB, 4>, _t: Tensor<TB, 1, Int>, _c: Option<Tensor<TB, 2>>| {
                let [batch_size, channels, height, width] = x.dims();
                Ok::<_, DiffusionError>(x.reshape([batch_size * channels, 1, height, width]))
            },
        );

        let result = pipeline.sample(&network, SampleRequest::new(2), &mut StdRng::seed_from_u64(1));

        match result {
            Err(DiffusionError::UnexpectedShape {
                expected, actual, ..
            }) => {
                assert_eq!(expected, vec![2, 3, 4, 4]);
                assert_eq!(actual, vec![6, 1, 4, 4]);
            }
            other => panic!("expected a shape error, got {other:?}"),
        }
    }

    #[test]
    fn test_unconditional_prediction_must_not_broadcast() {
        let pipeline = pipeline(10, 4);
        let network = PredictorFn::new(
            |x: Tensor<TB, 4>, _t: Tensor<TB, 1, Int>, c: Option<Tensor<TB, 2>>| {
                let [_, channels, height, width] = x.dims();
                let noise = match c {
                    Some(_) => x.zeros_like(),
                    None => Tensor::zeros([1, channels, height, width], &x.device()),
                };
                Ok::<_, DiffusionError>(noise)
            },
        );
        let request = SampleRequest::new(2)
            .with_conditioning(labels(2))
            .with_guidance_scale(3.0);

        let result = pipeline.sample(&network, request, &mut StdRng::seed_from_u64(1));

        assert!(matches!(
            result,
            Err(DiffusionError::UnexpectedShape {
                what: "unconditional predicted noise",
                ..
            })
        ));
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let pipeline = pipeline(10, 4);
        let network = RecordingNetwork::default();

        let images =
            pipeline.sample_images(&network, SampleRequest::new(0), &mut StdRng::seed_from_u64(1));
        let empty: Tensor<TB, 4> = Tensor::zeros([0, 3, 4, 4], &device());
        let loss = pipeline.training_loss(&network, empty, None, &mut StdRng::seed_from_u64(1));

        assert!(matches!(images, Err(DiffusionError::EmptyBatch)));
        assert!(matches!(loss, Err(DiffusionError::EmptyBatch)));
        assert_eq!(network.conditional_calls.get() + network.unconditional_calls.get(), 0);
    }

    #[test]
    fn test_network_errors_propagate_unchanged() {
        let pipeline = pipeline(10, 4);
        let network = FailingNetwork {
            calls: Cell::new(0),
        };

        let result = pipeline.sample(&network, SampleRequest::new(1), &mut StdRng::seed_from_u64(1));

        assert!(matches!(result, Err(NetworkError::Exploded(3))));
        assert_eq!(network.calls.get(), 3);
    }

    #[test]
    fn test_cancellation_is_checked_per_timestep() {
        let pipeline = pipeline(10, 4);
        let cancel = AtomicBool::new(true);
        let request = SampleRequest::new(1).with_cancel(&cancel);
        let network = RecordingNetwork::default();

        let result = pipeline.sample(&network, request, &mut StdRng::seed_from_u64(1));

        assert!(matches!(result, Err(DiffusionError::Cancelled { timestep: 9 })));
        assert_eq!(network.conditional_calls.get() + network.unconditional_calls.get(), 0);

        cancel.store(false, Ordering::Relaxed);
        let request = SampleRequest::new(1).with_cancel(&cancel);
        assert!(pipeline
            .sample(&network, request, &mut StdRng::seed_from_u64(1))
            .is_ok());
    }

    #[test]
    fn test_sample_images_are_displayable() {
        let pipeline = pipeline(10, 4);
        let network = RecordingNetwork::default();

        let rgb = pipeline
            .sample_images(&network, SampleRequest::new(2), &mut StdRng::seed_from_u64(3))
            .unwrap();
        let rgb8 = pipeline
            .sample_rgb8(&network, SampleRequest::new(2), &mut StdRng::seed_from_u64(3))
            .unwrap();

        assert_eq!(rgb.dims(), [2, 3, 4, 4]);
        assert!(rgb.into_data().value.iter().all(|v| (0.0..=1.0).contains(v)));
        let bytes = rgb8.into_data().convert::<i64>().value;
        assert!(bytes.iter().all(|b| (0..=255).contains(b)));
    }

    #[test]
    fn test_training_loss_uses_valid_timesteps() {
        let pipeline = pipeline(20, 4);
        let network = RecordingNetwork::default();
        let mut rng = StdRng::seed_from_u64(11);
        let images = randn::<TB, 4, _>([3, 3, 4, 4], &device(), &mut rng);

        let loss = pipeline
            .training_loss_with_features(&network, &MeanFeatures, images.clone(), images, &mut rng)
            .unwrap();

        let loss = loss.into_scalar();
        // A zero prediction leaves the variance of two unit-normal channels.
        assert!(loss.is_finite() && loss > 1.0 && loss < 3.0, "loss was {loss}");
        assert_eq!(network.conditional_calls.get(), 1);
        let timesteps = network.timesteps.borrow();
        assert_eq!(timesteps.len(), 3);
        assert!(timesteps.iter().all(|t| (1..20).contains(t)));
    }

    #[test]
    fn test_training_loss_validates_inputs() {
        let pipeline = pipeline(20, 4);
        let network = RecordingNetwork::default();
        let mut rng = StdRng::seed_from_u64(12);

        let gray: Tensor<TB, 4> = Tensor::zeros([2, 1, 4, 4], &device());
        assert!(matches!(
            pipeline.training_loss(&network, gray, None, &mut rng),
            Err(DiffusionError::ShapeMismatch { actual: 1, .. })
        ));

        let color: Tensor<TB, 4> = Tensor::zeros([2, 3, 4, 4], &device());
        assert!(matches!(
            pipeline.training_loss(&network, color, Some(labels(5)), &mut rng),
            Err(DiffusionError::ShapeMismatch { expected: 2, actual: 5, .. })
        ));
    }
}
