//! Configuration loader using figment.
//!
//! # Configuration Priority (lowest to highest)
//!
//! 1. Built-in defaults
//! 2. Programmatic overrides ([`ConfigLoader::merge`])
//! 3. The TOML file
//! 4. Environment variables (`MESHBOT_*`)
//!
//! # Environment Variable Mapping
//!
//! Environment variables use the `MESHBOT_` prefix with `__` as separator:
//!
//! - `MESHBOT_API__PORT=9000` → `api.port = 9000`
//! - `MESHBOT_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//! - `MESHBOT_DB__KEEP_PER_CONVERSATION=500` → `db.keep_per_conversation = 500`
//!
//! # File location
//!
//! `--config`, else `CONFIG_PATH`, else `/config/config.toml`. A missing file
//! is created from the bundled default before loading.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use tracing::{debug, info, trace};

use super::error::{ConfigError, ConfigResult};
use super::schema::MeshConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Config file used when neither `--config` nor `CONFIG_PATH` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "MESHBOT_";

/// The file written on first start.
pub const DEFAULT_CONFIG_TOML: &str = include_str!("default_config.toml");

/// Resolves the config file path: explicit, then `CONFIG_PATH`, then the default.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Writes the bundled default config to `path` unless a file exists.
///
/// Returns `true` when a file was written.
pub fn ensure_config_file(path: &Path) -> ConfigResult<bool> {
    if path.exists() {
        return Ok(false);
    }
    let write_err = |source| ConfigError::WriteDefault {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML).map_err(write_err)?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(true)
}

/// Configuration loader with figment-based multi-source support.
///
/// ```rust,ignore
/// let config = ConfigLoader::new()
///     .file("/config/config.toml")
///     .create_missing()
///     .load()?;
/// ```
pub struct ConfigLoader {
    /// Programmatic overrides.
    figment: Figment,
    /// Whether to load environment variables.
    load_env: bool,
    /// Config file to load.
    config_file: Option<PathBuf>,
    /// Write the bundled default when the file is missing.
    create_missing: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Creates a loader reading only defaults and the environment.
    pub fn new() -> Self {
        Self {
            figment: Figment::new(),
            load_env: true,
            config_file: None,
            create_missing: false,
        }
    }

    /// Sets the configuration file to load.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Writes the bundled default file when the configured file is missing.
    pub fn create_missing(mut self) -> Self {
        self.create_missing = true;
        self
    }

    /// Enables loading environment variables (default: true).
    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges configuration programmatically, below the file and environment.
    pub fn merge(mut self, config: MeshConfig) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(config));
        self
    }

    /// Loads and returns the configuration.
    pub fn load(self) -> ConfigResult<MeshConfig> {
        let figment = self.build_figment()?;
        let config: MeshConfig = figment.extract()?;

        debug!(
            nodes = config.nodes.len(),
            schedules = config.schedules.items.len(),
            logging_level = %config.logging.level,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Builds the figment instance with all sources.
    fn build_figment(self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(MeshConfig::default()));
        figment = figment.merge(self.figment);

        if let Some(path) = self.config_file {
            if self.create_missing {
                ensure_config_file(&path)?;
            }
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path));
            }
            info!(path = %path.display(), "Loading configuration file");
            figment = figment.merge(Toml::file(&path));
        }

        if self.load_env {
            trace!("Loading environment variables with {ENV_PREFIX} prefix");
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }

        Ok(figment)
    }
}

// =============================================================================
// Tests
// =============================================================================
