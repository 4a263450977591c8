//! Multiplexer configuration.

use crate::error::ConfigError;
use crate::frame::{MAX_MAX_FRAME_SIZE, MIN_MAX_FRAME_SIZE};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Which end of the connection this multiplexer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub role: Role,
    /// Byte capacity of each body pipe (inbound and outbound).
    pub body_pipe_capacity: usize,
    /// Outbound DATA frames are split at this size until the peer announces its own.
    pub max_frame_size: usize,
    /// Filled in for requests that carry no `:scheme`.
    pub default_scheme: String,
    /// Filled in for requests that carry no `:authority`.
    pub default_authority: Option<String>,
    /// Log per-stream transitions at debug level.
    pub debug_streams: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            body_pipe_capacity: 64 * 1024,
            max_frame_size: MIN_MAX_FRAME_SIZE as usize,
            default_scheme: "https".to_string(),
            default_authority: None,
            debug_streams: false,
        }
    }
}

impl MuxConfig {
    pub fn client() -> Self {
        Self::default()
    }

    pub fn server() -> Self {
        Self {
            role: Role::Server,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.body_pipe_capacity == 0 {
            return Err(ConfigError::Invalid(
                "body_pipe_capacity must be greater than zero".to_string(),
            ));
        }
        let frame_range = MIN_MAX_FRAME_SIZE as usize..=MAX_MAX_FRAME_SIZE as usize;
        if !frame_range.contains(&self.max_frame_size) {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size {} outside {}..={}",
                self.max_frame_size, MIN_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE
            )));
        }
        if self.default_scheme.is_empty() {
            return Err(ConfigError::Invalid(
                "default_scheme must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<MuxConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<MuxConfig, ConfigError> {
    let config: MuxConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}
