//! Push command - build, release and deploy a source directory

use super::ps::state_label;
use crate::cli::args::PushArgs;
use crate::error::{ShipyardError, ShipyardResult};
use crate::events::{EventFilter, JobEvent};
use crate::gateway::PushGateway;
use crate::scheduler::short_id;
use crate::transcript::Transcript;
use crate::ui::{self, UiContext};
use console::style;
use futures_util::StreamExt;
use std::path::PathBuf;
use tracing::debug;

pub async fn execute(args: PushArgs, gateway: &PushGateway) -> ShipyardResult<()> {
    let ctx = UiContext::detect();
    let source = match args.path {
        Some(path) => path,
        None => std::env::current_dir()
            .map_err(|e| ShipyardError::io("getting current directory", e))?,
    };
    let source = resolve_source(source)?;

    let transcript = Transcript::with_sink(|line| println!("{}", line));
    let push = gateway.push(&args.app, &source, &transcript);
    tokio::pin!(push);

    let outcome = tokio::select! {
        result = &mut push => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            ui::step_warn(&ctx, "Interrupted, cancelling push...");
            gateway.interrupt();
            push.await
        }
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            gateway.shutdown().await;
            return Err(e);
        }
    };

    ui::step_ok_detail(
        &ctx,
        &format!("{} v{} deployed", args.app, outcome.release.version),
        &outcome.formation.to_string(),
    );
    if !outcome.recovering.is_empty() {
        ui::step_warn(
            &ctx,
            &format!("Still restarting: {}", outcome.recovering.join(", ")),
        );
    }

    if !args.follow {
        ui::remark(
            &ctx,
            "Jobs stop when shipyard exits; use --follow to keep them running",
        );
        gateway.shutdown().await;
        return Ok(());
    }

    let result = follow(&ctx, gateway, &args.app).await;
    gateway.shutdown().await;
    result
}

fn resolve_source(path: PathBuf) -> ShipyardResult<PathBuf> {
    if !path.is_dir() {
        return Err(ShipyardError::PathNotFound(path));
    }
    Ok(path)
}

/// Stream job events until Ctrl-C
async fn follow(ctx: &UiContext, gateway: &PushGateway, app: &str) -> ShipyardResult<()> {
    let events = gateway.subscribe(app, EventFilter::default()).await?.into_stream();
    tokio::pin!(events);
    ui::section(ctx, "Following job events (Ctrl-C to stop)");

    for job in gateway.ps(app).await? {
        if job.state.is_active() {
            println!(
                "  {} {}.{} {}",
                style("·").dim(),
                job.process_type,
                job.short_id(),
                state_label(job.state)
            );
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                ui::step_info(ctx, "Stopping jobs...");
                return Ok(());
            }
            event = events.next() => match event {
                Some(event) => print_event(&event?),
                None => {
                    debug!("Event stream for {} closed", app);
                    return Ok(());
                }
            }
        }
    }
}

fn print_event(event: &JobEvent) {
    println!(
        "  {} {}.{} {}",
        style(event.timestamp.format("%H:%M:%S")).dim(),
        event.process_type,
        short_id(event.job_id),
        state_label(event.state)
    );
}
