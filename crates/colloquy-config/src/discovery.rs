//! Locating and layering config files.
//!
//! Two files are consulted, lowest precedence first:
//!
//! | Layer   | Path                                              |
//! |---------|---------------------------------------------------|
//! | user    | `$COLLOQUY_CONFIG_DIR/config.toml`, else the platform config dir |
//! | project | `<project dir>/colloquy.toml`, else `./colloquy.toml` |
//!
//! Command-line flags are applied by the binary on top of the result.
//! A missing file is skipped silently. A file that cannot be read or
//! parsed is skipped with a warning, so one broken layer never hides the
//! other.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{ColloquyConfig, ConfigError, Result};

const APP_NAME: &str = "colloquy";
const CONFIG_DIR_ENV: &str = "COLLOQUY_CONFIG_DIR";
const USER_FILE: &str = "config.toml";
const PROJECT_FILE: &str = "colloquy.toml";

/// Which layer a config file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    User,
    Project,
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Project => "project",
        })
    }
}

/// A file that was looked for during discovery.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub layer: ConfigLayer,
    pub path: PathBuf,
    /// False when the file was absent or unusable.
    pub loaded: bool,
}

/// Merged configuration plus what discovery found along the way.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ColloquyConfig,
    /// Every candidate file, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Problems worth showing the user; none of them stop startup.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    fn empty() -> Self {
        Self {
            config: ColloquyConfig::new(),
            sources: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Paths of the files that contributed to the config.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }

    fn apply(&mut self, layer: ConfigLayer, path: PathBuf) {
        let loaded = path.is_file()
            && match load_config_file(&path) {
                Ok(file) => {
                    tracing::debug!(%layer, path = %path.display(), "Config layer applied");
                    self.config.merge(file);
                    true
                }
                Err(e) => {
                    self.warnings
                        .push(format!("Failed to load {} config {}: {}", layer, path.display(), e));
                    false
                }
            };
        self.sources.push(ConfigSource { layer, path, loaded });
    }

    fn check(&mut self) {
        if self.config.llm.as_ref().is_some_and(|l| l.has_plaintext_api_key()) {
            self.warnings.push(
                "[llm] api_key is stored in plaintext; prefer the backend's environment variable"
                    .to_string(),
            );
        }
        if let Err(e) = self.config.validate() {
            self.warnings.push(e.to_string());
        }
    }
}

/// Discover and merge config for the given project directory.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], with the user config directory pinned.
///
/// A `config_dir` wins over `COLLOQUY_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut loaded = LoadedConfig::empty();

    let user = config_dir.map(Path::to_path_buf).or_else(user_config_dir);
    if let Some(dir) = user {
        loaded.apply(ConfigLayer::User, dir.join(USER_FILE));
    }
    let project = project_dir.unwrap_or_else(|| Path::new("."));
    loaded.apply(ConfigLayer::Project, project.join(PROJECT_FILE));

    loaded.check();
    for warning in &loaded.warnings {
        tracing::warn!(%warning, "Config warning");
    }
    Ok(loaded)
}

/// Parse one config file, without discovery or validation.
pub fn load_config_file(path: &Path) -> Result<ColloquyConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    ColloquyConfig::from_toml(&text)
}

/// Where `colloquy config init` writes the user config.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|dir| dir.join(USER_FILE))
}

/// `COLLOQUY_CONFIG_DIR` when set and non-empty, else `<platform config dir>/colloquy`.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|dir| dir.join(APP_NAME)),
    }
}
