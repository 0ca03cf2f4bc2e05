//! Configuration system for the tollgate proxy.
//!
//! Provides TOML-based configuration with:
//! - `[server]` listener settings and trusted forwarders
//! - `[proxy]` routing prefix, login redirect and rewrite target
//! - `[backend]` API base URL, refresh endpoint and timeouts
//! - `[cookies]` credential cookie names and attributes
//! - Config file layering (user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, Layer, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
