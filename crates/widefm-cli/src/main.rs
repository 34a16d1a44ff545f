//! WideFM CLI - train, predict, dump and convert sparse FM models.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use widefm_cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("widefm=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(cmd) => cmd.run()?,
        Commands::Pred(cmd) => cmd.run()?,
        Commands::Dump(cmd) => cmd.run()?,
        Commands::Convert(cmd) => cmd.run()?,
    }

    info!("done");
    Ok(())
}
