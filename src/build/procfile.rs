//! Procfile parsing

use crate::error::{ShipyardError, ShipyardResult};
use std::collections::BTreeMap;
use std::path::Path;

/// Process type name to command
pub type ProcessTypes = BTreeMap<String, String>;

/// Parse `name: command` lines; blank lines and `#` comments are skipped
pub fn parse(content: &str) -> ShipyardResult<ProcessTypes> {
    let mut processes = ProcessTypes::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (name, command) = line.split_once(':').ok_or_else(|| {
            ShipyardError::BuildFailure(format!("Procfile line {}: expected `name: command`", index + 1))
        })?;
        let name = name.trim();
        let command = command.trim();

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ShipyardError::BuildFailure(format!(
                "Procfile line {}: invalid process type {:?}",
                index + 1,
                name
            )));
        }
        if command.is_empty() {
            return Err(ShipyardError::BuildFailure(format!(
                "Procfile line {}: empty command for {}",
                index + 1,
                name
            )));
        }

        processes.insert(name.to_string(), command.to_string());
    }

    Ok(processes)
}

/// Load the Procfile at the root of a compiled tree, if any
pub fn load(dir: &Path) -> ShipyardResult<ProcessTypes> {
    let path = dir.join("Procfile");
    if !path.is_file() {
        return Ok(ProcessTypes::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| ShipyardError::io(format!("reading {}", path.display()), e))?;
    parse(&content)
}
