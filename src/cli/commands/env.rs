//! Env command - show, set or unset app environment variables

use crate::cli::args::{EnvAction, EnvArgs};
use crate::error::ShipyardResult;
use crate::gateway::PushGateway;
use crate::ui::{self, UiContext};
use console::style;

pub async fn execute(args: EnvArgs, gateway: &PushGateway) -> ShipyardResult<()> {
    let ctx = UiContext::detect();

    match args.action {
        None => {
            let app = gateway.app(&args.app).await?;
            if app.env.is_empty() {
                ui::step_info(&ctx, &format!("{} has no environment variables", app.name));
            }
            for (key, value) in &app.env {
                println!("{}={}", style(key).bold(), value);
            }
        }
        Some(EnvAction::Set { vars }) => {
            let keys: Vec<String> = vars.iter().map(|(k, _)| k.clone()).collect();
            gateway.set_env(&args.app, vars).await?;
            ui::step_ok(&ctx, &format!("Set {}", keys.join(", ")));
            ui::remark(&ctx, "Takes effect on the next push");
        }
        Some(EnvAction::Unset { keys }) => {
            gateway.unset_env(&args.app, &keys).await?;
            ui::step_ok(&ctx, &format!("Unset {}", keys.join(", ")));
            ui::remark(&ctx, "Takes effect on the next push");
        }
    }

    Ok(())
}
