mod auth;
mod cli;
mod commands;
mod config;
mod logging;
mod output;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands, ConfigCommands};
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let file = config::load(cli.config.as_deref())?;

    let level = cli.log_level.as_deref().unwrap_or(&file.logging.level);
    config::validate_level(level)?;
    logging::init_tracing_with_level(level);

    match &cli.command {
        Commands::Sync(args) => {
            let mut config = config::resolve(&file, &args.run)?;
            config.force_update |= args.force_update;
            let batch = auth::connect(&file, &args.run, &config).await?;
            let report = commands::sync::sync(&config, &batch).await?;
            if !report.is_success() {
                anyhow::bail!("{} policy operation(s) failed", report.failed());
            }
        }
        Commands::Plan(args) => {
            let config = config::resolve(&file, args)?;
            let batch = auth::connect(&file, args, &config).await?;
            commands::plan::plan(&config, &batch).await?;
        }
        Commands::Config(args) => match &args.command {
            ConfigCommands::Show => {
                println!("{}", toml::to_string_pretty(&file)?);
            }
        },
    }

    Ok(())
}
