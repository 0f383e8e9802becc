//! Configuration module for caprel
//!
//! This module handles loading and validating configuration from files
//! and command line arguments.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure for caprel
#[derive(Debug, Serialize, Deserialize)]
pub struct CaprelConfig {
    pub rewrite: RewriteConfig,
    pub analysis: AnalysisConfig,
    pub replay: ReplayConfig,
    pub logging: LoggingConfig,
}

/// Capture rewrite configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Cap on per-packet error strings kept per run
    pub max_errors: usize,
}

/// Capture analysis configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub max_packets: u64,
    pub performance_limit: u64,
}

/// Replay supervisor configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// External replay utility to invoke
    pub utility: String,
    pub default_speed: f64,
    pub max_speed_multiplier: f64,
    pub max_pps: f64,
    pub history_file: String,
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for CaprelConfig {
    fn default() -> Self {
        Self {
            rewrite: RewriteConfig { max_errors: 100 },
            analysis: AnalysisConfig {
                max_packets: 1_000_000,
                performance_limit: 100_000,
            },
            replay: ReplayConfig {
                utility: "tcpreplay".to_string(),
                default_speed: 1.0,
                max_speed_multiplier: 100.0,
                max_pps: 1_000_000.0,
                history_file: "replay_history.json".to_string(),
            },
            logging: LoggingConfig {
                log_level: "info".to_string(),
                log_file: None,
            },
        }
    }
}

impl CaprelConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_str: String = std::fs::read_to_string(path)?;
        let config: CaprelConfig = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rewrite.max_errors == 0 {
            return Err(ConfigError::ValidationError(
                "rewrite.max_errors must be greater than 0".to_string(),
            ));
        }

        if self.analysis.max_packets == 0 || self.analysis.performance_limit == 0 {
            return Err(ConfigError::ValidationError(
                "analysis packet ceilings must be greater than 0".to_string(),
            ));
        }

        if self.replay.utility.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "replay.utility must not be empty".to_string(),
            ));
        }
        if self.replay.default_speed <= 0.0 {
            return Err(ConfigError::ValidationError(
                "replay.default_speed must be greater than 0".to_string(),
            ));
        }
        if self.replay.max_speed_multiplier <= 0.0 || self.replay.max_pps <= 0.0 {
            return Err(ConfigError::ValidationError(
                "replay speed limits must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
