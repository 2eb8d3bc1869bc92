use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print or export the coefficients of a noise schedule
    Schedule {
        #[clap(flatten)]
        args: cli::schedule::ScheduleArgs,
    },
    /// Forward-diffuse an image at a given timestep and save the result
    Noise {
        #[clap(flatten)]
        args: cli::noise::NoiseArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Schedule { args } => {
            cli::schedule::handle_schedule(args)?;
        }
        Commands::Noise { args } => {
            cli::noise::handle_noise(args)?;
        }
    }

    Ok(())
}
