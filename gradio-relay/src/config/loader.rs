//! Configuration loading from files and environment variables.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};

use crate::error::{RelayError, RelayResult};

use super::RelayConfig;

/// Load configuration from `config.*` in the working directory and `RELAY__*` env vars
pub fn load_config() -> RelayResult<RelayConfig> {
    let builder = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );

    build(builder)
}

fn build(builder: ConfigBuilder<DefaultState>) -> RelayResult<RelayConfig> {
    builder
        .build()
        .map_err(|e| RelayError::Config {
            message: format!("Failed to build config: {}", e),
        })?
        .try_deserialize()
        .map_err(|e| RelayError::Config {
            message: format!("Failed to deserialize config: {}", e),
        })
}
