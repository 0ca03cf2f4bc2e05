//! Start command - launches the proxy server.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args;

use tollgate_config::{Environment, TollgateConfig};
use tollgate_proxy::{CookieSettings, ProxyConfig, ProxyServer};

use super::Context;

/// Arguments for the start command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Backend API base URL (overrides config)
    #[arg(long, env = "TOLLGATE_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Routing prefix stripped before forwarding (overrides config)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Development mode: credential cookies without the Secure attribute
    #[arg(long)]
    pub dev: bool,

    /// Path to config file (overrides default discovery)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Run the start command.
pub async fn run(args: StartArgs, ctx: &Context) -> Result<()> {
    let loaded = super::load_config(args.config.as_deref())?;
    for warning in &loaded.warnings {
        eprintln!("warning: {}", warning);
    }

    let config = apply_overrides(loaded.config, &args);
    config.validate()?;

    let proxy_config = build_proxy_config(&config)?;
    if ctx.verbose {
        eprintln!("Proxy config: {:?}", proxy_config);
    }

    tracing::debug!(prefix = %proxy_config.prefix, login = %proxy_config.login_path, "Proxy configured");
    ProxyServer::new(proxy_config)?.run().await?;
    Ok(())
}

/// Layer CLI flags over the loaded config.
fn apply_overrides(mut config: TollgateConfig, args: &StartArgs) -> TollgateConfig {
    let mut server = config.server();
    if let Some(port) = args.port {
        server.port = port;
    }
    if let Some(bind) = &args.bind {
        server.bind = bind.clone();
    }
    config.server = Some(server);

    let mut proxy = config.proxy();
    if let Some(prefix) = &args.prefix {
        proxy.prefix = prefix.clone();
    }
    if args.dev {
        proxy.environment = Environment::Development;
    }
    config.proxy = Some(proxy);

    if let Some(url) = &args.backend_url {
        let mut backend = config.backend();
        backend.base_url = Some(url.clone());
        config.backend = Some(backend);
    }

    config
}

/// Translate validated file config into the proxy's runtime config.
fn build_proxy_config(config: &TollgateConfig) -> Result<ProxyConfig> {
    let server = config.server();
    let proxy = config.proxy();
    let backend = config.backend();
    let cookies = config.cookies();

    let ip: IpAddr = server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", server.bind))?;
    let base_url = backend
        .base_url
        .clone()
        .context("No backend URL configured (set [backend] base_url or --backend-url)")?;

    Ok(ProxyConfig::new(base_url)
        .with_bind_addr(SocketAddr::new(ip, server.port))
        .with_prefix(proxy.prefix)
        .with_login_path(proxy.login_path)
        .with_target(proxy.target, proxy.change_origin)
        .with_max_body_size(proxy.max_body_bytes)
        .with_refresh_path(backend.refresh_path)
        .with_timeout(Duration::from_secs(backend.timeout_secs))
        .with_expired_message(backend.expired_message)
        .with_cookies(CookieSettings {
            access_name: cookies.access_name,
            refresh_name: cookies.refresh_name,
            secure: config.cookies_secure(),
            refresh_fallback_max_age: cookies.refresh_fallback_max_age_secs,
        })
        .with_trusted_forwarders(server.trusted_forwarders)
        .with_request_logging(server.request_logging))
}
