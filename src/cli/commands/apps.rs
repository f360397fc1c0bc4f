//! App commands - create, delete, list

use crate::cli::args::{CreateArgs, DeleteArgs};
use crate::error::ShipyardResult;
use crate::gateway::PushGateway;
use crate::ui::{self, UiContext};
use console::style;

pub async fn create(args: CreateArgs, gateway: &PushGateway) -> ShipyardResult<()> {
    let ctx = UiContext::detect();
    let app = gateway.create_app(&args.name).await?;
    ui::step_ok_detail(&ctx, &format!("Created {}", app.name), &app.id.to_string());
    Ok(())
}

pub async fn delete(args: DeleteArgs, gateway: &PushGateway) -> ShipyardResult<()> {
    let ctx = UiContext::detect().with_auto_yes(args.yes);
    // Fail on unknown apps before prompting
    let app = gateway.app(&args.name).await?;

    let prompt = format!("Delete {} with its releases and build cache?", app.name);
    if !ui::confirm(&ctx, &prompt, false).await? {
        ui::step_warn_hint(&ctx, "Not deleted", "Pass -y to skip the prompt");
        return Ok(());
    }

    gateway.delete_app(&app.name).await?;
    ui::step_ok(&ctx, &format!("Deleted {}", app.name));
    Ok(())
}

pub async fn list(gateway: &PushGateway) -> ShipyardResult<()> {
    let ctx = UiContext::detect();
    let apps = gateway.list_apps().await;

    if apps.is_empty() {
        ui::step_info(&ctx, "No apps yet");
        ui::remark(&ctx, "Create one with: shipyard create <name>");
        return Ok(());
    }

    println!(
        "{:<30} {:<10} {:<17}",
        style("NAME").bold(),
        style("RELEASE").bold(),
        style("CREATED").bold()
    );
    println!("{}", "-".repeat(57));

    for app in &apps {
        let release = match gateway.releases(&app.name).await?.last() {
            Some(release) => style(format!("v{}", release.version)).green(),
            None => style("none".to_string()).dim(),
        };
        println!(
            "{:<30} {:<10} {:<17}",
            app.name,
            release,
            app.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("{} app(s)", apps.len());
    Ok(())
}
