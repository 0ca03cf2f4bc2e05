//! Token command - decode bearer tokens.

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Subcommand};

use tollgate_proxy::{Credential, TokenInfo};

use super::Context;

/// Arguments for the token command.
#[derive(Args, Debug)]
pub struct TokenArgs {
    #[command(subcommand)]
    pub command: TokenCommand,
}

#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Show when a token expires
    Inspect {
        /// The token to decode
        token: String,

        /// Treat as a refresh token (an expiry claim is optional)
        #[arg(long)]
        refresh: bool,
    },
}

/// Run the token command.
pub async fn run(args: TokenArgs, ctx: &Context) -> Result<()> {
    match args.command {
        TokenCommand::Inspect { token, refresh } => cmd_inspect(&token, refresh, ctx),
    }
}

fn cmd_inspect(token: &str, refresh: bool, ctx: &Context) -> Result<()> {
    let credential = if refresh {
        Credential::refresh(token)
    } else {
        Credential::access(token)?
    };
    let info = TokenInfo::from_credential(&credential, Utc::now());

    if ctx.json_output {
        let out = serde_json::json!({
            "kind": if refresh { "refresh" } else { "access" },
            "expires_at": info.expires_at.map(|t| t.to_rfc3339()),
            "expires_in_secs": info.expires_in_secs,
            "expired": info.is_expired,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    match info.expires_at {
        Some(at) => println!("Expires at: {}", at.to_rfc3339()),
        None => println!("Expires at: unknown"),
    }
    println!("Expires in: {}", info.expires_in_display());
    Ok(())
}
