//! Configuration: TOML file plus `MESHBOT_` environment overrides, layered
//! with figment, then validated.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    CONFIG_PATH_ENV, ConfigLoader, DEFAULT_CONFIG_PATH, config_path, ensure_config_file,
};
pub use schema::{
    ApiConfig, BotConfig, CommandsConfig, DbConfig, DispatchConfig, HeartbeatConfig,
    HeartbeatMode, LogFormat, LogLevel, LogOutput, LoggingConfig, MeshConfig, NodeConfig,
    PluginsConfig, ScheduleItemConfig, SchedulesConfig, WebhookConfig,
};
pub use validation::validate_config;
