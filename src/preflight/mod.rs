//! Preflight checks run before the builder starts any worker.
//!
//! A missing images directory or a build command that is not installed would
//! otherwise surface as a FAILED build on every pass.

use crate::config::{split_command, BuilderConfig};
use anyhow::{bail, Result};
use std::path::PathBuf;

/// Resolve a command to its path, searching PATH unless it already has a
/// directory component.
pub fn command_path(cmd: &str) -> Option<PathBuf> {
    which::which(cmd).ok()
}

/// Check that every diskimage's build command can be found.
pub fn check_build_commands(config: &BuilderConfig) -> Result<()> {
    let mut missing = Vec::new();
    for image in &config.diskimages {
        let (program, _) = split_command(&image.dib_cmd)?;
        if command_path(&program).is_none() {
            missing.push((image.name.as_str(), program));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(image, program)| format!("  {program} (diskimage: {image})"))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing build commands:\n{msg}");
    }
    Ok(())
}

/// All checks the orchestrator requires before starting.
pub fn check_builder(config: &BuilderConfig) -> Result<()> {
    if !config.images_dir.is_dir() {
        bail!(
            "images_dir '{}' does not exist or is not a directory",
            config.images_dir.display()
        );
    }
    check_build_commands(config)
}
