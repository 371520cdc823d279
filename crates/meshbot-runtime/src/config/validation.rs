//! Configuration validation utilities.

use std::collections::HashSet;

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogLevel, LogOutput, MeshConfig, NodeConfig};
use crate::scheduler::{jobs_from_config, parse_timezone};

/// Validates the entire configuration.
pub fn validate_config(config: &MeshConfig) -> ConfigResult<()> {
    validate_logging(config)?;
    validate_nodes(&config.nodes)?;

    if config.api.enabled && config.api.port == 0 {
        return Err(ConfigError::validation("api.port must be greater than 0"));
    }
    if config.db.keep_per_conversation == 0 {
        return Err(ConfigError::validation(
            "db.keep_per_conversation must be greater than 0",
        ));
    }
    if config.db.pool_size == 0 {
        return Err(ConfigError::validation("db.pool_size must be greater than 0"));
    }
    if config.dispatch.max_text_len < 16 {
        return Err(ConfigError::validation(
            "dispatch.max_text_len must be at least 16",
        ));
    }
    if config.dispatch.submit_timeout_ms == 0 || config.plugins.timeout_ms == 0 {
        return Err(ConfigError::validation("timeouts must be greater than 0"));
    }

    let webhook = config.webhook.url.trim();
    if !webhook.is_empty() {
        validate_url(webhook, &["http://", "https://"])?;
    }

    for command in &config.commands.list {
        if command.trigger.trim().is_empty() {
            return Err(ConfigError::validation("commands.list: empty trigger"));
        }
    }

    parse_timezone(&config.schedules.timezone)?;
    jobs_from_config(config)?;

    Ok(())
}

fn validate_logging(config: &MeshConfig) -> ConfigResult<()> {
    let logging = &config.logging;
    if LogLevel::parse(&logging.level).is_none() {
        return Err(ConfigError::validation(format!(
            "Invalid log level: {}. Valid values are: trace, debug, info, warn, error",
            logging.level
        )));
    }
    for (module, level) in &logging.filters {
        if LogLevel::parse(level).is_none() {
            return Err(ConfigError::validation(format!(
                "Invalid log level for '{module}': {level}"
            )));
        }
    }
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output = \"file\"",
        ));
    }
    Ok(())
}

fn validate_nodes(nodes: &[NodeConfig]) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for node in nodes {
        let name = node.name.trim();
        if name.is_empty() {
            return Err(ConfigError::validation("nodes: every node needs a name"));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(ConfigError::validation(format!(
                "nodes: duplicate node name '{name}'"
            )));
        }
        validate_url(node.url.trim(), &["ws://", "wss://"])?;
    }
    Ok(())
}

/// Checks the scheme and that something follows it.
fn validate_url(url: &str, schemes: &[&str]) -> ConfigResult<()> {
    let Some(rest) = schemes.iter().find_map(|s| url.strip_prefix(s)) else {
        return Err(ConfigError::invalid_url(
            url,
            format!("URL must start with one of: {schemes:?}"),
        ));
    };
    if rest.is_empty() || rest.starts_with('/') {
        return Err(ConfigError::invalid_url(url, "missing host"));
    }
    Ok(())
}
