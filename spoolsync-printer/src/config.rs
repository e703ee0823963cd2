use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{PrinterError, Result};

/// Connection settings for one physical printer.
#[derive(Serialize, Deserialize, Clone)]
pub struct PrinterConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    pub serial: String,
    pub access_code: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Disconnect notifications within this window after a message are ignored.
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default)]
    pub calibration: CalibrationConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CalibrationConf {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for CalibrationConf {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

fn default_port() -> u16 {
    8883
}

fn default_keep_alive() -> u64 {
    15
}

fn default_log_capacity() -> usize {
    100
}

fn default_disconnect_grace() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    2
}

impl PrinterConfig {
    pub fn new(
        host: impl Into<String>,
        serial: impl Into<String>,
        access_code: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            host: host.into(),
            serial: serial.into(),
            access_code: access_code.into(),
            port: default_port(),
            keep_alive_secs: default_keep_alive(),
            client_id: None,
            log_capacity: default_log_capacity(),
            disconnect_grace_secs: default_disconnect_grace(),
            reconnect_delay_secs: default_reconnect_delay(),
            calibration: CalibrationConf::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(PrinterError::Config("host is empty".into()));
        }
        if self.serial.trim().is_empty() {
            return Err(PrinterError::Config("serial is empty".into()));
        }
        if self.access_code.is_empty() {
            return Err(PrinterError::Config(format!("access code missing for {}", self.serial)));
        }
        if self.calibration.max_retries == 0 {
            return Err(PrinterError::Config("calibration.max_retries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("spoolsync_{}", self.serial))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.serial)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn calibration_timeout(&self) -> Duration {
        Duration::from_millis(self.calibration.timeout_ms)
    }

    pub fn calibration_backoff(&self) -> Duration {
        Duration::from_millis(self.calibration.backoff_ms)
    }
}

impl fmt::Debug for PrinterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrinterConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("serial", &self.serial)
            .field("access_code", &"***")
            .field("port", &self.port)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("client_id", &self.client_id)
            .field("calibration", &self.calibration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_filled_from_minimal_json() {
        let cfg: PrinterConfig = serde_json::from_value(serde_json::json!({
            "host": "192.168.1.40",
            "serial": "01P00A000000001",
            "access_code": "12345678"
        }))
        .unwrap();

        assert_eq!(cfg.port, 8883);
        assert_eq!(cfg.keep_alive_secs, 15);
        assert_eq!(cfg.log_capacity, 100);
        assert_eq!(cfg.calibration, CalibrationConf::default());
        assert_eq!(cfg.client_id(), "spoolsync_01P00A000000001");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(PrinterConfig::new("", "S1", "code").validate().is_err());
        assert!(PrinterConfig::new("h", "", "code").validate().is_err());
        assert!(PrinterConfig::new("h", "S1", "").validate().is_err());
    }

    #[test]
    fn debug_output_hides_access_code() {
        let cfg = PrinterConfig::new("h", "S1", "secret-code");
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("secret-code"));
    }
}
