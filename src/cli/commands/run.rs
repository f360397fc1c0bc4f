//! Run command - one-off command against the latest release

use crate::cli::args::RunArgs;
use crate::error::ShipyardResult;
use crate::gateway::PushGateway;
use tracing::debug;

/// Returns the command's exit code
pub async fn execute(args: RunArgs, gateway: &PushGateway) -> ShipyardResult<i32> {
    debug!("Running {:?} for {}", args.command, args.app);
    let print = |line: String| println!("{}", line);
    gateway.run(&args.app, args.command, &print).await
}
