use std::marker::PhantomData;

use burn::{
    config::Config,
    tensor::{backend::Backend, Tensor},
};
use rand::Rng;

use super::BetaSchedule;
use crate::error::{self, DiffusionError};
use crate::utils::{batch_coefficients, randn};

/// The configuration for the DDPM scheduler.
#[derive(Config, Debug)]
pub struct DDPMSchedulerConfig {
    /// Number of diffusion steps, the horizon of the forward process.
    #[config(default = 500)]
    pub noise_steps: usize,
    /// The value of beta at the first timestep.
    #[config(default = 1e-4)]
    pub beta_start: f64,
    /// The value of beta at the last timestep.
    #[config(default = 0.02)]
    pub beta_end: f64,
    /// How beta evolves between the two ends.
    #[config(default = "BetaSchedule::Linear")]
    pub beta_schedule: BetaSchedule,
    /// Side of the square frames produced when sampling.
    #[config(default = 128)]
    pub image_size: usize,
}

/// Noise schedule of a denoising diffusion probabilistic model.
///
/// Holds `beta`, `alpha = 1 - beta` and the running product `alpha_hat`,
/// all computed in `f64` and indexed by timestep. Once built the schedule is
/// read-only.
#[derive(Debug, Clone)]
pub struct DDPMScheduler<B: Backend> {
    timesteps: Vec<usize>,
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    config: DDPMSchedulerConfig,
    __phantom: PhantomData<B>,
}

impl<B: Backend> DDPMScheduler<B> {
    pub fn new(config: DDPMSchedulerConfig) -> error::Result<Self> {
        validate(&config)?;

        let betas = config
            .beta_schedule
            .betas(config.beta_start, config.beta_end, config.noise_steps);
        let alphas: Vec<f64> = betas.iter().map(|beta| 1.0 - beta).collect();
        let mut alphas_cumprod = Vec::with_capacity(alphas.len());

        for alpha in &alphas {
            alphas_cumprod.push(alpha * alphas_cumprod.last().copied().unwrap_or(1.0))
        }

        if let Some(t) = alphas_cumprod
            .iter()
            .position(|&alpha_hat| !(alpha_hat > 0.0 && alpha_hat < 1.0))
        {
            return Err(DiffusionError::InvalidSchedule(format!(
                "cumulative alpha leaves (0, 1) at timestep {t}: {}",
                alphas_cumprod[t]
            )));
        }

        tracing::debug!(
            noise_steps = config.noise_steps,
            beta_start = config.beta_start,
            beta_end = config.beta_end,
            final_alpha_hat = alphas_cumprod[alphas_cumprod.len() - 1],
            "built noise schedule"
        );

        Ok(Self {
            timesteps: (1..config.noise_steps).rev().collect(),
            betas,
            alphas,
            alphas_cumprod,
            config,
            __phantom: PhantomData,
        })
    }

    /// Adds noise to a batch of clean images, one timestep per image.
    ///
    /// Samples `q(x_t | x_0)` in closed form and returns the noised batch
    /// together with the exact noise that was drawn, which is the training
    /// target of the denoising network.
    pub fn noise_images<R: Rng>(
        &self,
        images: Tensor<B, 4>,
        timesteps: &[usize],
        rng: &mut R,
    ) -> error::Result<(Tensor<B, 4>, Tensor<B, 4>)> {
        let dims = images.dims();
        if timesteps.len() != dims[0] {
            return Err(DiffusionError::ShapeMismatch {
                what: "timestep batch",
                expected: dims[0],
                actual: timesteps.len(),
            });
        }
        for &t in timesteps {
            self.check_timestep(t)?;
        }

        let device = images.device();
        let (sqrt_alpha_hat, sqrt_one_minus_alpha_hat): (Vec<f64>, Vec<f64>) = timesteps
            .iter()
            .map(|&t| {
                let alpha_hat = self.alpha_hat(t);
                (alpha_hat.sqrt(), (1.0 - alpha_hat).sqrt())
            })
            .unzip();
        let noise = randn::<B, 4, R>(dims, &device, rng);

        let noised = images * batch_coefficients::<B>(&sqrt_alpha_hat, &device)
            + noise.clone() * batch_coefficients::<B>(&sqrt_one_minus_alpha_hat, &device);

        Ok((noised, noise))
    }

    /// Adds the given noise to `original` at a single timestep.
    pub fn add_noise<const D: usize>(
        &self,
        original: Tensor<B, D>,
        noise: Tensor<B, D>,
        timestep: usize,
    ) -> error::Result<Tensor<B, D>> {
        self.check_timestep(timestep)?;
        let alpha_hat = self.alpha_hat(timestep);

        Ok(original.mul_scalar(alpha_hat.sqrt()) + noise.mul_scalar((1.0 - alpha_hat).sqrt()))
    }

    /// Draws `n` training timesteps uniformly from `[1, noise_steps)`.
    pub fn sample_timesteps<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<usize> {
        (0..n)
            .map(|_| rng.gen_range(1..self.config.noise_steps))
            .collect()
    }

    // Perform a backward step
    //
    // No noise is injected at timestep 1, the last step of the reverse chain.
    pub fn step<const D: usize, R: Rng>(
        &self,
        predicted_noise: Tensor<B, D>,
        timestep: usize,
        sample: Tensor<B, D>,
        rng: &mut R,
    ) -> error::Result<Tensor<B, D>> {
        if timestep == 0 {
            return Err(DiffusionError::TimestepOutOfRange {
                timestep,
                noise_steps: self.config.noise_steps,
            });
        }
        self.check_timestep(timestep)?;

        let alpha = self.alpha(timestep);
        let alpha_hat = self.alpha_hat(timestep);
        let beta = self.beta(timestep);

        let prev_sample = sample
            .sub(predicted_noise.mul_scalar((1.0 - alpha) / (1.0 - alpha_hat).sqrt()))
            .mul_scalar(1.0 / alpha.sqrt());

        if timestep > 1 {
            let noise = randn::<B, D, R>(prev_sample.dims(), &prev_sample.device(), rng);
            Ok(prev_sample + noise.mul_scalar(beta.sqrt()))
        } else {
            Ok(prev_sample)
        }
    }

    fn check_timestep(&self, timestep: usize) -> error::Result<()> {
        if timestep >= self.config.noise_steps {
            return Err(DiffusionError::TimestepOutOfRange {
                timestep,
                noise_steps: self.config.noise_steps,
            });
        }

        Ok(())
    }

    /// Timesteps visited by the reverse process, from `noise_steps - 1` down to 1.
    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    pub fn noise_steps(&self) -> usize {
        self.config.noise_steps
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    pub fn config(&self) -> &DDPMSchedulerConfig {
        &self.config
    }

    pub fn beta(&self, timestep: usize) -> f64 {
        self.betas[timestep]
    }

    pub fn alpha(&self, timestep: usize) -> f64 {
        self.alphas[timestep]
    }

    pub fn alpha_hat(&self, timestep: usize) -> f64 {
        let alpha_hat = self.alphas_cumprod[timestep];
        debug_assert!(
            alpha_hat > 0.0 && alpha_hat < 1.0,
            "alpha_hat[{timestep}] = {alpha_hat} is degenerate"
        );
        alpha_hat
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }
}

fn validate(config: &DDPMSchedulerConfig) -> error::Result<()> {
    let invalid = |reason: String| Err(DiffusionError::InvalidSchedule(reason));

    if config.noise_steps < 2 {
        return invalid(format!(
            "at least 2 noise steps are required, got {}",
            config.noise_steps
        ));
    }
    for (name, beta) in [("beta_start", config.beta_start), ("beta_end", config.beta_end)] {
        if !(beta > 0.0 && beta < 1.0) {
            return invalid(format!("{name} must lie in (0, 1), got {beta}"));
        }
    }
    if config.beta_start >= config.beta_end {
        return invalid(format!(
            "beta_start ({}) must be smaller than beta_end ({})",
            config.beta_start, config.beta_end
        ));
    }

    Ok(())
}
