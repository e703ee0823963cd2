//! Agent configuration
//!
//! Handles:
//! - the list of printers (host, serial, access code, link tuning)
//! - agent behaviour (status refresh, message log, calibration read on connect)
//! - OS-specific storage, overridable with `SPOOLSYNC_AGENT_CONFIG`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spoolsync_printer::PrinterConfig;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "SPOOLSYNC_AGENT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default, rename = "printer")]
    pub printers: Vec<PrinterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Seconds between two `pushall` refreshes; 0 disables them.
    pub refresh_interval_secs: u64,
    pub message_log: bool,
    pub read_calibration_on_connect: bool,
    pub calibration_nozzle: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            message_log: false,
            read_calibration_on_connect: true,
            calibration_nozzle: "0.4".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load config from the default location; defaults when the file is missing.
    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AgentConfig =
            toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;

        for printer in &config.printers {
            printer
                .validate()
                .with_context(|| format!("Invalid printer entry {}", printer.display_name()))?;
        }
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?).await
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// `SPOOLSYNC_AGENT_CONFIG` if set, else the OS config directory.
    pub fn config_file_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("spoolsync-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn is_first_time_setup() -> bool {
        Self::config_file_path().map(|p| !p.exists()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("absent.toml")).await.unwrap();
        assert!(config.printers.is_empty());
        assert_eq!(config.agent.refresh_interval_secs, 300);
        assert_eq!(config.agent.calibration_nozzle, "0.4");
    }

    #[tokio::test]
    async fn test_printer_table_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
[agent]
message_log = true

[[printer]]
name = "X1C atelier"
host = "192.168.1.40"
serial = "01P00A000000001"
access_code = "12345678"
"#,
        )
        .await
        .unwrap();

        let config = AgentConfig::load_from(&path).await.unwrap();
        assert!(config.agent.message_log);
        assert!(config.agent.read_calibration_on_connect);
        assert_eq!(config.printers.len(), 1);
        assert_eq!(config.printers[0].port, 8883);
        assert_eq!(config.printers[0].client_id(), "spoolsync_01P00A000000001");
    }

    #[tokio::test]
    async fn test_invalid_printer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let content = "[[printer]]\nhost = \"10.0.0.2\"\nserial = \"S\"\naccess_code = \"\"\n";
        tokio::fs::write(&path, content).await.unwrap();
        assert!(AgentConfig::load_from(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_save_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/spoolsync/config.toml");

        let mut config = AgentConfig::default();
        config.printers.push(PrinterConfig::new("10.0.0.2", "0948AD000000001", "abcd1234"));
        config.save_to(&path).await.unwrap();

        let loaded = AgentConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded.printers[0].serial, "0948AD000000001");
    }

    #[tokio::test]
    async fn test_env_override_drives_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent/config.toml");
        std::env::set_var(CONFIG_ENV_VAR, &path);

        assert!(AgentConfig::is_first_time_setup());
        let mut config = AgentConfig::load().await.unwrap();
        config.agent.refresh_interval_secs = 60;
        config.save().await.unwrap();

        assert!(path.exists());
        let loaded = AgentConfig::load().await.unwrap();
        std::env::remove_var(CONFIG_ENV_VAR);
        assert_eq!(loaded.agent.refresh_interval_secs, 60);
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("config"));
    }
}
