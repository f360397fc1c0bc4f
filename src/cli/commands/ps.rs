//! Ps and releases commands

use crate::cli::args::AppArgs;
use crate::error::ShipyardResult;
use crate::gateway::PushGateway;
use crate::scheduler::JobState;
use crate::ui::{self, UiContext};
use console::{style, StyledObject};

pub(crate) fn state_label(state: JobState) -> StyledObject<String> {
    let label = state.to_string();
    match state {
        JobState::Up => style(label).green(),
        JobState::Pending | JobState::Starting => style(label).yellow(),
        JobState::Crashed => style(label).red(),
        JobState::Stopping | JobState::Down => style(label).dim(),
    }
}

/// Show the app's formation and the jobs this process knows about
pub async fn ps(args: AppArgs, gateway: &PushGateway) -> ShipyardResult<()> {
    let ctx = UiContext::detect();
    let formation = gateway.formation(&args.app).await?;
    let jobs = gateway.ps(&args.app).await?;

    ui::key_value(&ctx, "Formation", &formation.to_string());
    ui::key_value(&ctx, "Runtime", gateway.runtime_name());

    if jobs.is_empty() {
        ui::remark(&ctx, "No jobs running in this process; push with --follow to run them");
        return Ok(());
    }

    println!();
    println!(
        "{:<10} {:<12} {:<10} {:<8} {:<8}",
        style("JOB").bold(),
        style("TYPE").bold(),
        style("STATE").bold(),
        style("PORT").bold(),
        style("PID").bold()
    );
    println!("{}", "-".repeat(52));
    for job in &jobs {
        println!(
            "{:<10} {:<12} {:<10} {:<8} {:<8}",
            job.short_id(),
            job.process_type,
            state_label(job.state),
            job.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            job.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

pub async fn releases(args: AppArgs, gateway: &PushGateway) -> ShipyardResult<()> {
    let ctx = UiContext::detect();
    let releases = gateway.releases(&args.app).await?;

    if releases.is_empty() {
        ui::step_info(&ctx, &format!("{} has no releases yet", args.app));
        return Ok(());
    }

    println!(
        "{:<8} {:<14} {:<14} {:<24} {:<17}",
        style("VERSION").bold(),
        style("ARTIFACT").bold(),
        style("BUILDPACK").bold(),
        style("PROCESSES").bold(),
        style("CREATED").bold()
    );
    println!("{}", "-".repeat(80));
    for release in releases.iter().rev() {
        let processes = if release.processes.is_empty() {
            "(none)".to_string()
        } else {
            release.processes.keys().cloned().collect::<Vec<_>>().join(",")
        };
        println!(
            "{:<8} {:<14} {:<14} {:<24} {:<17}",
            format!("v{}", release.version),
            release.artifact.short(),
            release.buildpack,
            processes,
            release.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
