//! Configuration for the panel daemon and the node agent

mod agent;
mod panel;
pub mod serde_utils;

pub use agent::{AgentConfig, BackoffConfig};
pub use panel::{
    AgentsConfig, DeployConfig, HistoryConfig, OperatorToken, PanelConfig, ShellConfig,
    SyncConfig,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Default configuration directory (`<config dir>/fleet-panel`)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleet-panel")
}

/// Default panel configuration file
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("panel.toml")
}

/// Default directory for persisted state (registry, jobs, metrics, audit)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleet-panel")
}

/// Load a TOML configuration file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Write a configuration file, creating its directory
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config::<PanelConfig>(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.toml");
        let mut config = AgentConfig::default();
        config.agent_id = "agt-1".into();
        config.token = "secret".into();
        save_config(&path, &config).unwrap();

        let loaded: AgentConfig = load_config(&path).unwrap();
        assert_eq!(loaded.agent_id, "agt-1");
        assert_eq!(loaded.token, "secret");
    }
}
