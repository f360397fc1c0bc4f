//! Config command - show configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager, StateLayout};
use crate::error::ShipyardResult;

pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> ShipyardResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => show_path(config, manager),
    }
    Ok(())
}

fn show_config(config: &Config) -> ShipyardResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn show_path(config: &Config, manager: &ConfigManager) {
    println!("{}", manager.path().display());
    println!("{}", StateLayout::from_config(config).root().display());
}
