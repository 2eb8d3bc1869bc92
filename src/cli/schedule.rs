use std::fmt::Write as _;
use std::fs;

use anyhow::Result;
use clap::Args;
use colorize_diffusion::schedulers::ddpm::DDPMScheduler;

use super::{Backend, ScheduleOptions};

#[derive(Args, Debug)]
pub struct ScheduleArgs {
    #[clap(flatten)]
    schedule: ScheduleOptions,

    /// Print one row every `every` timesteps.
    #[arg(long, default_value_t = 50)]
    every: usize,

    /// Write every timestep to this CSV file.
    #[arg(long, value_name = "FILE")]
    csv: Option<String>,
}

pub fn handle_schedule(args: &ScheduleArgs) -> Result<()> {
    let scheduler = DDPMScheduler::<Backend>::new(args.schedule.config(1))?;
    let last = scheduler.noise_steps() - 1;

    println!("{:>6} {:>12} {:>12} {:>12}", "t", "beta", "alpha", "alpha_hat");
    for t in (0..=last).filter(|t| t % args.every.max(1) == 0 || *t == last) {
        println!(
            "{:>6} {:>12.6e} {:>12.8} {:>12.6e}",
            t,
            scheduler.beta(t),
            scheduler.alpha(t),
            scheduler.alpha_hat(t)
        );
    }

    if let Some(path) = &args.csv {
        let mut csv = String::from("t,beta,alpha,alpha_hat\n");
        for t in 0..=last {
            writeln!(
                csv,
                "{t},{},{},{}",
                scheduler.beta(t),
                scheduler.alpha(t),
                scheduler.alpha_hat(t)
            )?;
        }
        fs::write(path, csv)?;
        tracing::info!(path = %path, "wrote schedule");
    }

    Ok(())
}
