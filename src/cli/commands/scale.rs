//! Scale command - change process counts and converge

use crate::cli::args::ScaleArgs;
use crate::error::ShipyardResult;
use crate::gateway::PushGateway;
use crate::release::Formation;
use crate::ui::{self, UiContext};

pub async fn execute(args: ScaleArgs, gateway: &PushGateway) -> ShipyardResult<()> {
    let ctx = UiContext::detect();
    let changes = Formation::parse(args.assignments.iter().map(String::as_str))?;

    ui::step_info(&ctx, &format!("Scaling {} to {}...", args.app, changes));
    let scaled = gateway.scale(&args.app, &changes).await;
    gateway.shutdown().await;
    let (release, formation) = scaled?;

    ui::step_ok_detail(
        &ctx,
        &format!("{} v{} scaled", args.app, release.version),
        &formation.to_string(),
    );
    ui::remark(
        &ctx,
        "Jobs stop when shipyard exits; push with --follow to keep them running",
    );
    Ok(())
}
