//! Shipyard - git-push style build and deploy
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use shipyard::cli::{commands, Cli, Commands};
use shipyard::config::{Config, ConfigManager, StateLayout};
use shipyard::error::ShipyardResult;
use shipyard::gateway::PushGateway;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, config: &Config) {
    // 0 = warn, 1 = info, 2+ = debug
    let filter = match verbose {
        0 => EnvFilter::new("shipyard=warn"),
        1 => EnvFilter::new("shipyard=info"),
        _ => EnvFilter::new("shipyard=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> ShipyardResult<ExitCode> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = manager.load().await?;
    init_logging(cli.verbose, &config);
    debug!("Loaded config from {}", manager.path().display());

    if let Commands::Config(args) = cli.command {
        commands::config(args, &config, &manager).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let layout = StateLayout::from_config(&config);
    let gateway = PushGateway::open(&config, &layout).await?;
    debug!(
        "State in {}, jobs run as {}",
        layout.root().display(),
        gateway.runtime_name()
    );

    match cli.command {
        Commands::Config(_) => unreachable!("Config handled above"),
        Commands::Create(args) => commands::create(args, &gateway).await?,
        Commands::Delete(args) => commands::delete(args, &gateway).await?,
        Commands::Apps => commands::apps(&gateway).await?,
        Commands::Env(args) => commands::env(args, &gateway).await?,
        Commands::Push(args) => commands::push(args, &gateway).await?,
        Commands::Scale(args) => commands::scale(args, &gateway).await?,
        Commands::Ps(args) => commands::ps(args, &gateway).await?,
        Commands::Releases(args) => commands::releases(args, &gateway).await?,
        Commands::Run(args) => {
            let code = commands::run(args, &gateway).await?;
            return Ok(ExitCode::from(code.clamp(0, 255) as u8));
        }
    }

    Ok(ExitCode::SUCCESS)
}
