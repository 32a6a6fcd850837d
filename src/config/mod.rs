pub mod types;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use std::path::Path;
pub use types::*;

/// Prefix for environment overrides, e.g. `TOOLBRIDGE__SERVER__COMMAND`
pub const ENV_PREFIX: &str = "TOOLBRIDGE";

/// Load configuration from an optional TOML file, then apply environment overrides
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path = path.as_ref();

    let config = Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.args")
                .with_list_parse_key("server.passthrough_env")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to load config from: {}", path.display()))?;

    let app_config: AppConfig = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// Validate the loaded configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.server.command.trim().is_empty() {
        anyhow::bail!("Tool server command must not be empty");
    }

    for key in &config.server.passthrough_env {
        if key.trim().is_empty() {
            anyhow::bail!("Passthrough environment variable names must not be empty");
        }
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        anyhow::bail!(
            "Invalid log level '{}'. Valid levels: {}",
            config.logging.level,
            valid_levels.join(", ")
        );
    }

    let valid_formats = ["pretty", "json"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        anyhow::bail!(
            "Invalid log format '{}'. Valid formats: {}",
            config.logging.format,
            valid_formats.join(", ")
        );
    }

    let timeouts = &config.timeouts;
    if timeouts.handshake_secs == 0 || timeouts.call_secs == 0 || timeouts.shutdown_grace_ms == 0 {
        anyhow::bail!("Timeouts must be greater than zero");
    }

    if config.agent.max_steps == 0 {
        anyhow::bail!("agent.max_steps must be at least 1");
    }
    if config.agent.max_concurrent_calls == 0 {
        anyhow::bail!("agent.max_concurrent_calls must be at least 1");
    }

    Ok(())
}
