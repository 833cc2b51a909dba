//! Configuration management for the rate limiting service.
//!
//! This module handles loading application configuration from environment
//! variables and configuration files.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

/// Load configuration from a file (when present) and the environment
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default())
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("detection.volumetric_request_threshold", 1000)?
        .set_default("detection.volumetric_window_seconds", 60)?
        .set_default("detection.distributed_ip_threshold", 100)?
        .set_default("detection.distributed_window_seconds", 120)?
        .set_default("detection.app_layer_request_threshold", 50)?
        .set_default("detection.app_layer_endpoint_threshold", 10)?
        .set_default("detection.app_layer_confidence_divisor", 20.0)?
        .set_default("detection.timeline_retention_seconds", 300)?
        .set_default("cleanup.interval_seconds", 300)?
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_a_file() {
        let config = load_config().expect("defaults should load");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.detection.volumetric_request_threshold, 1000);
        assert_eq!(config.cleanup.interval_seconds, 300);
    }
}
