use clap::Args;
use colorize_diffusion::schedulers::ddpm::DDPMSchedulerConfig;
use colorize_diffusion::schedulers::BetaSchedule;

pub mod noise;
pub mod schedule;

#[cfg(feature = "wgpu")]
pub type Backend = burn::backend::Wgpu;

#[cfg(all(feature = "torch", not(feature = "wgpu")))]
pub type Backend = burn::backend::LibTorch<f32>;

#[cfg(not(any(feature = "wgpu", feature = "torch")))]
pub type Backend = burn::backend::NdArray<f32>;

/// Noise schedule options shared by the subcommands.
#[derive(Args, Debug)]
pub struct ScheduleOptions {
    /// Number of diffusion steps.
    #[arg(long, default_value_t = 500)]
    noise_steps: usize,

    /// Beta at the first timestep.
    #[arg(long, default_value_t = 1e-4)]
    beta_start: f64,

    /// Beta at the last timestep.
    #[arg(long, default_value_t = 0.02)]
    beta_end: f64,

    /// Interpolate the square root of beta instead of beta.
    #[arg(long, action)]
    scaled_linear: bool,
}

impl ScheduleOptions {
    pub fn config(&self, image_size: usize) -> DDPMSchedulerConfig {
        let beta_schedule = if self.scaled_linear {
            BetaSchedule::ScaledLinear
        } else {
            BetaSchedule::Linear
        };

        DDPMSchedulerConfig::new()
            .with_noise_steps(self.noise_steps)
            .with_beta_start(self.beta_start)
            .with_beta_end(self.beta_end)
            .with_beta_schedule(beta_schedule)
            .with_image_size(image_size)
    }
}
