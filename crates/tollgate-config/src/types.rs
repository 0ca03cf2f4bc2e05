//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [server]     # listener settings
//! [proxy]      # routing prefix, login redirect, rewrite target
//! [backend]    # API base URL and refresh endpoint
//! [cookies]    # credential cookie names and attributes
//! ```

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default bind address.
pub const DEFAULT_BIND: &str = "127.0.0.1";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TollgateConfig {
    pub server: Option<ServerConfig>,
    pub proxy: Option<ProxySection>,
    pub backend: Option<BackendConfig>,
    pub cookies: Option<CookieConfig>,
}

impl TollgateConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Merging is per section: a section present in `other` replaces ours
    /// wholesale.
    pub fn merge(&mut self, other: TollgateConfig) {
        if other.server.is_some() {
            self.server = other.server;
        }

        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }

        if other.backend.is_some() {
            self.backend = other.backend;
        }

        if other.cookies.is_some() {
            self.cookies = other.cookies;
        }
    }

    /// A fully populated config, as written by `config init`.
    pub fn with_defaults() -> Self {
        Self {
            server: Some(ServerConfig::default()),
            proxy: Some(ProxySection::default()),
            backend: Some(BackendConfig::default()),
            cookies: Some(CookieConfig::default()),
        }
    }

    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn proxy(&self) -> ProxySection {
        self.proxy.clone().unwrap_or_default()
    }

    pub fn backend(&self) -> BackendConfig {
        self.backend.clone().unwrap_or_default()
    }

    pub fn cookies(&self) -> CookieConfig {
        self.cookies.clone().unwrap_or_default()
    }

    /// Whether credential cookies carry the `Secure` attribute.
    ///
    /// An explicit `cookies.secure` wins; otherwise cookies are secure
    /// everywhere but development.
    pub fn cookies_secure(&self) -> bool {
        self.cookies()
            .secure
            .unwrap_or(self.proxy().environment != Environment::Development)
    }

    /// Check the values the proxy cannot start without.
    pub fn validate(&self) -> Result<()> {
        let proxy = self.proxy();
        if !proxy.prefix.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "proxy.prefix".to_string(),
                reason: format!("'{}' must start with '/'", proxy.prefix),
            });
        }

        let backend = self.backend();
        match backend.base_url.as_deref() {
            None | Some("") => {
                return Err(ConfigError::MissingField {
                    field: "base_url".to_string(),
                    context: "[backend]".to_string(),
                });
            }
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return Err(ConfigError::Invalid {
                    field: "backend.base_url".to_string(),
                    reason: format!("'{}' is not an http(s) URL", url),
                });
            }
            Some(_) => {}
        }

        if !backend.refresh_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "backend.refresh_path".to_string(),
                reason: format!("'{}' must start with '/'", backend.refresh_path),
            });
        }

        if backend.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "backend.timeout_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let cookies = self.cookies();
        if cookies.access_name.is_empty() || cookies.refresh_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "cookies".to_string(),
                reason: "cookie names must not be empty".to_string(),
            });
        }
        if cookies.access_name == cookies.refresh_name {
            return Err(ConfigError::Invalid {
                field: "cookies".to_string(),
                reason: "access and refresh cookies must have different names".to_string(),
            });
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Server configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind to.
    pub bind: String,
    /// Enable request logging.
    pub request_logging: bool,
    /// Peers whose own `Authorization` header is forwarded as-is.
    pub trusted_forwarders: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            request_logging: true,
            trusted_forwarders: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

/// Proxy routing section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// Routing prefix stripped before forwarding.
    pub prefix: String,
    /// Login page for callers with no credentials to refresh.
    pub login_path: String,
    pub environment: Environment,
    /// Explicit target origin; the backend base URL when unset.
    pub target: Option<String>,
    pub change_origin: bool,
    /// Largest inbound body buffered for forwarding.
    pub max_body_bytes: usize,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            prefix: "/api".to_string(),
            login_path: "/".to_string(),
            environment: Environment::default(),
            target: None,
            change_origin: false,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Backend API section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: Option<String>,
    pub refresh_path: String,
    pub timeout_secs: u64,
    /// `message` the backend sends with a 401 for an expired access token.
    pub expired_message: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            refresh_path: "/auth/refresh".to_string(),
            timeout_secs: 30,
            expired_message: "Token expired".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cookie Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Credential cookie section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    pub access_name: String,
    pub refresh_name: String,
    /// Overrides the environment-derived `Secure` attribute.
    pub secure: Option<bool>,
    /// `Max-Age` for refresh tokens with no `exp` claim.
    pub refresh_fallback_max_age_secs: i64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            access_name: "access_token".to_string(),
            refresh_name: "refresh_token".to_string(),
            secure: None,
            refresh_fallback_max_age_secs: 7 * 24 * 60 * 60,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
