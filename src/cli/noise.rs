use anyhow::{ensure, Result};
use clap::Args;
use colorize_diffusion::schedulers::ddpm::DDPMScheduler;
use colorize_diffusion::utils::color::{rgb_to_yuv, yuv_to_rgb8};
use colorize_diffusion::utils::frames::{image_to_tensor, save_images};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{Backend, ScheduleOptions};

#[derive(Args, Debug)]
pub struct NoiseArgs {
    /// The colour frame to noise.
    input: String,

    /// Where to write the noised frames.
    #[arg(short, long, default_value = "noised.png")]
    output: String,

    /// Timesteps to noise the frame at, one grid cell each.
    #[arg(short, long, num_args = 1.., default_values_t = [1, 100, 250, 499])]
    timesteps: Vec<usize>,

    /// Side of the square frame fed to the forward process.
    #[arg(long, default_value_t = 128)]
    image_size: usize,

    /// The random seed used to draw the noise.
    #[arg(long, default_value_t = 2023)]
    seed: u64,

    #[clap(flatten)]
    schedule: ScheduleOptions,
}

pub fn handle_noise(args: &NoiseArgs) -> Result<()> {
    ensure!(!args.timesteps.is_empty(), "at least one timestep is required");
    let device = Default::default();
    let scheduler = DDPMScheduler::<Backend>::new(args.schedule.config(args.image_size))?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let size = args.image_size as u32;
    let frame = image::open(&args.input)?
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();
    let frame = rgb_to_yuv(image_to_tensor::<Backend>(&frame, &device))?;
    let batch = frame.repeat(0, args.timesteps.len());

    let (noised, _noise) = scheduler.noise_images(batch, &args.timesteps, &mut rng)?;
    save_images(yuv_to_rgb8(noised)?, &args.output)?;
    tracing::info!(output = %args.output, timesteps = ?args.timesteps, "saved noised frames");

    Ok(())
}
