//! CLI command handlers.

pub mod config;
pub mod start;
pub mod token;

use std::path::Path;

use anyhow::Result;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// Load an explicit config file, or discover the layered one.
pub fn load_config(explicit: Option<&Path>) -> Result<tollgate_config::LoadedConfig> {
    match explicit {
        Some(path) => Ok(tollgate_config::LoadedConfig::from_file(path)?),
        None => Ok(tollgate_config::load_config(None)?),
    }
}
