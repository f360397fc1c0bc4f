//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Shipyard - push source, get running processes
///
/// Builds an app with a buildpack, records a release and runs its
/// process formation as local jobs.
#[derive(Parser, Debug)]
#[command(name = "shipyard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "SHIPYARD_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an app
    Create(CreateArgs),

    /// Delete an app with its releases and build cache
    Delete(DeleteArgs),

    /// List apps
    Apps,

    /// Show or change an app's environment
    Env(EnvArgs),

    /// Build and deploy a source directory
    Push(PushArgs),

    /// Run a one-off command against the latest release
    Run(RunArgs),

    /// Change process counts without rebuilding
    Scale(ScaleArgs),

    /// Show an app's jobs
    Ps(AppArgs),

    /// Show an app's release history
    Releases(AppArgs),

    /// Show configuration
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// App name (lowercase letters, digits, dashes)
    pub name: String,
}

#[derive(Parser, Debug)]
pub struct DeleteArgs {
    pub name: String,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Commands that only take an app name
#[derive(Parser, Debug)]
pub struct AppArgs {
    pub app: String,
}

#[derive(Parser, Debug)]
pub struct EnvArgs {
    pub app: String,

    #[command(subcommand)]
    pub action: Option<EnvAction>,
}

#[derive(Subcommand, Debug)]
pub enum EnvAction {
    /// Set variables (KEY=VALUE)
    Set {
        #[arg(required = true, value_parser = parse_env_var)]
        vars: Vec<(String, String)>,
    },

    /// Remove variables
    Unset {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[derive(Parser, Debug)]
pub struct PushArgs {
    pub app: String,

    /// Source directory (defaults to current directory)
    #[arg(short, long)]
    pub path: Option<PathBuf>,

    /// Keep jobs running and stream their events until Ctrl-C
    #[arg(short, long)]
    pub follow: bool,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    pub app: String,

    /// Command and arguments to run
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct ScaleArgs {
    pub app: String,

    /// Process counts as TYPE=N
    #[arg(required = true)]
    pub assignments: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,
}

/// Parse a KEY=VALUE pair
fn parse_env_var(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE format: no '=' found in '{s}'"))?;
    if pos == 0 {
        return Err(format!("invalid KEY=VALUE format: empty key in '{s}'"));
    }
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}
