//! Finding, layering and writing tollgate config files.
//!
//! The user file (`<config dir>/config.toml`) is read first and the
//! project file (`./tollgate.toml`) is merged over it section by section.
//! `tollgate start` flags go on top of both. A file that fails to parse is
//! skipped with a warning so a stray project file cannot block startup.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{ConfigError, Environment, Result, TollgateConfig};

const PROJECT_FILE: &str = "tollgate.toml";
const USER_FILE: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "TOLLGATE_CONFIG_DIR";

/// Where a config file sits in the override order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    User,
    Project,
    /// Passed with `--config`; nothing else is read.
    Explicit,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::User => "user",
            Layer::Project => "project",
            Layer::Explicit => "explicit",
        })
    }
}

/// A file that was looked for.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub layer: Layer,
    pub path: PathBuf,
    pub loaded: bool,
}

/// Merged config plus the trail of files behind it.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: TollgateConfig,
    /// Lowest precedence first.
    pub sources: Vec<ConfigSource>,
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Read exactly one file. Unlike discovery, a bad file is an error.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut loaded = Self {
            config: load_config_file(path)?,
            sources: vec![ConfigSource {
                layer: Layer::Explicit,
                path: path.to_path_buf(),
                loaded: true,
            }],
            warnings: Vec::new(),
        };
        loaded.check_cookie_security();
        Ok(loaded)
    }

    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }

    /// Merge `path` over what is already loaded, if it exists and parses.
    fn overlay(&mut self, layer: Layer, path: PathBuf) {
        let loaded = path.is_file()
            && match load_config_file(&path) {
                Ok(file) => {
                    self.config.merge(file);
                    true
                }
                Err(e) => {
                    self.warnings
                        .push(format!("Failed to load {}: {}", path.display(), e));
                    false
                }
            };
        self.sources.push(ConfigSource {
            layer,
            path,
            loaded,
        });
    }

    fn check_cookie_security(&mut self) {
        if self.config.proxy().environment == Environment::Production
            && self.config.cookies().secure == Some(false)
        {
            self.warnings.push(
                "[cookies] secure = false in a production environment. \
                 Credential cookies will be sent over plain HTTP."
                    .to_string(),
            );
        }
    }
}

/// Discover and merge the user and project files.
///
/// `project_dir` defaults to the working directory.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], with `config_dir` replacing the user config directory.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut loaded = LoadedConfig::default();

    let user_file = match config_dir {
        Some(dir) => Some(dir.join(USER_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_file {
        loaded.overlay(Layer::User, path);
    }

    let project_file = match project_dir {
        Some(dir) => dir.join(PROJECT_FILE),
        None => PathBuf::from(PROJECT_FILE),
    };
    loaded.overlay(Layer::Project, project_file);

    loaded.check_cookie_security();
    Ok(loaded)
}

pub fn load_config_file(path: &Path) -> Result<TollgateConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    TollgateConfig::from_toml(&text)
}

/// Write `config` as TOML, creating missing parent directories.
pub fn save_config(config: &TollgateConfig, path: &Path) -> Result<()> {
    let write_err = |path: &Path| {
        let path = path.display().to_string();
        move |source: std::io::Error| ConfigError::WriteFile { path, source }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err(parent))?;
    }
    std::fs::write(path, config.to_toml()?).map_err(write_err(path))
}

pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|dir| dir.join(USER_FILE))
}

/// `$TOLLGATE_CONFIG_DIR` when set and non-empty, else the platform config
/// directory's `tollgate/`.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|dir| dir.join("tollgate")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
