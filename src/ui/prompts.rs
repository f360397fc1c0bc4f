//! Confirmation prompt with non-interactive fallback

use super::context::UiContext;
use crate::error::{ShipyardError, ShipyardResult};
use std::io::{self, BufRead, Write};

/// Ask a yes/no question; auto-yes and non-interactive contexts skip the prompt
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> ShipyardResult<bool> {
    if ctx.auto_yes() {
        println!("  {} (auto-approved)", message);
        return Ok(true);
    }

    if !ctx.is_interactive() {
        return Ok(default);
    }

    let hint = if default { "[Y/n]" } else { "[y/N]" };
    let prompt = format!("  {} {} ", message, hint);
    let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut stdout = io::stdout();
        stdout.write_all(prompt.as_bytes())?;
        stdout.flush()?;
        let mut input = String::new();
        io::stdin().lock().read_line(&mut input)?;
        Ok(input)
    })
    .await
    .map_err(|e| ShipyardError::User(format!("Prompt task failed: {}", e)))?
    .map_err(|e| ShipyardError::io("reading confirmation", e))?;

    Ok(parse_answer(&answer, default))
}

fn parse_answer(input: &str, default: bool) -> bool {
    match input.trim().to_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    }
}
