//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use tollgate_config::TollgateConfig;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the merged configuration and where it came from
    Show {
        /// Path to config file (overrides default discovery)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show which config files are loaded and their precedence
    Which,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./tollgate.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show { config } => cmd_show(config, ctx),
        ConfigCommand::Which => cmd_which(),
        ConfigCommand::Init { local } => cmd_init(local),
        ConfigCommand::Path => cmd_path(),
    }
}

fn cmd_show(explicit: Option<PathBuf>, ctx: &Context) -> Result<()> {
    let loaded = super::load_config(explicit.as_deref())?;
    let config = &loaded.config;

    if ctx.json_output {
        let sources: Vec<String> = loaded
            .loaded_from()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let out = serde_json::json!({
            "sources": sources,
            "warnings": loaded.warnings,
            "cookies_secure": config.cookies_secure(),
            "server": {
                "bind": config.server().bind,
                "port": config.server().port,
            },
            "proxy": {
                "prefix": config.proxy().prefix,
                "login_path": config.proxy().login_path,
            },
            "backend": {
                "base_url": config.backend().base_url,
                "refresh_path": config.backend().refresh_path,
                "timeout_secs": config.backend().timeout_secs,
            },
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("# tollgate configuration\n");

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("No config files loaded (using defaults)\n");
    } else {
        println!("Config files:");
        for source in &sources {
            println!("  {}", source.display());
        }
        println!();
    }

    for warning in &loaded.warnings {
        println!("warning: {}", warning);
    }

    // Show every section with defaults filled in.
    let resolved = TollgateConfig {
        server: Some(config.server()),
        proxy: Some(config.proxy()),
        backend: Some(config.backend()),
        cookies: Some(config.cookies()),
    };
    println!("{}", resolved.to_toml()?);
    println!("# cookies secure: {}", config.cookies_secure());

    if let Err(e) = config.validate() {
        println!("\n# not startable as-is: {}", e);
    }

    Ok(())
}

fn cmd_which() -> Result<()> {
    let loaded = tollgate_config::load_config(None)?;

    println!("Config file search order (later overrides earlier):\n");

    for source in &loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} [{}] {}", status, source.layer, source.path.display());
    }

    println!();
    let loaded_count = loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Run 'tollgate config init' to create one.");
    } else {
        println!("{} config file(s) loaded.", loaded_count);
    }

    Ok(())
}

fn cmd_init(local: bool) -> Result<()> {
    let path = if local {
        PathBuf::from("tollgate.toml")
    } else {
        tollgate_config::user_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
    };

    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }

    tollgate_config::save_config(&TollgateConfig::with_defaults(), &path)?;
    println!("Created {}", path.display());
    println!("Set [backend] base_url before running 'tollgate start'.");
    Ok(())
}

fn cmd_path() -> Result<()> {
    if let Some(path) = tollgate_config::user_config_path() {
        println!("{}", path.display());
    } else {
        eprintln!("Could not determine config directory");
    }
    Ok(())
}
