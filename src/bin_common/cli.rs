//! CLI utilities for binaries
//!
//! Handles configuration loading and environment variables
//! for all binary executables.

use anyhow::Context;
use realtime::PriorityConfig;
use std::path::{Path, PathBuf};

/// Type of configuration to load
#[derive(Debug, Clone)]
pub enum ConfigType {
    /// Transport configuration (config/transport.yaml)
    Transport,
    /// Custom path
    Custom(String),
}

impl ConfigType {
    /// Get the default path for this config type
    pub fn default_path(&self) -> &str {
        match self {
            ConfigType::Transport => "config/transport.yaml",
            ConfigType::Custom(path) => path,
        }
    }

    /// Get the environment variable name for this config type
    pub fn env_var_name(&self) -> &str {
        match self {
            ConfigType::Transport => "TRANSPORT_CONFIG_PATH",
            ConfigType::Custom(_) => "CONFIG_PATH",
        }
    }
}

/// Load configuration path from environment or use default
///
/// # Examples
/// ```
/// use realtime_client::bin_common::{load_config_from_env, ConfigType};
///
/// let path = load_config_from_env(ConfigType::Transport);
/// ```
pub fn load_config_from_env(config_type: ConfigType) -> PathBuf {
    std::env::var(config_type.env_var_name())
        .unwrap_or_else(|_| config_type.default_path().to_string())
        .into()
}

/// Read a [`PriorityConfig`] from a YAML file
pub fn load_priority_config(path: impl AsRef<Path>) -> anyhow::Result<PriorityConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: PriorityConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse command line arguments for a binary
///
/// Returns a vector of arguments (excluding the program name)
pub fn parse_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}
