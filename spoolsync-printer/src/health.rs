/**
 * HEALTH - Alertes HMS et santé du lien MQTT
 *
 * RÔLE :
 * - Décodage des codes HMS (module, sévérité) envoyés dans `print.hms`
 * - Suivi de la liaison : statut, reconnexions, dernier message reçu
 * - Filtre des déconnexions parasites (message reçu il y a moins de N secondes)
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::HealthAlert;

const DEFAULT_SEVERITY: u32 = 3;

/// Decodes the `hms` array. Entries that are not objects are skipped.
pub fn decode_alerts(hms: &Value) -> Vec<HealthAlert> {
    let Some(list) = hms.as_array() else {
        return Vec::new();
    };

    list.iter()
        .filter_map(Value::as_object)
        .map(|entry| {
            let raw = entry.get("code").or_else(|| entry.get("attr"));
            let code = match raw {
                Some(Value::Number(n)) => match n.as_u64() {
                    Some(v) => format!("{v:#x}"),
                    None => n.to_string(),
                },
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "0".to_string(),
            };
            let (module, severity) = decode_code(&code);
            HealthAlert {
                code,
                module,
                severity,
            }
        })
        .collect()
}

fn decode_code(code: &str) -> (u32, u32) {
    let digits = code.trim_start_matches("0x");
    let parsed = if digits.is_empty() { Ok(0) } else { u64::from_str_radix(digits, 16) };
    match parsed {
        Ok(value) => {
            let severity = ((value >> 16) & 0xF) as u32;
            let module = ((value >> 24) & 0xFF) as u32;
            (module, if severity == 0 { DEFAULT_SEVERITY } else { severity })
        }
        Err(_) => (0, DEFAULT_SEVERITY),
    }
}

pub fn severity_label(severity: u32) -> &'static str {
    match severity {
        1 => "fatal",
        2 => "serious",
        3 => "common",
        4 => "info",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkHealthReport {
    pub status: LinkStatus,
    pub reconnects: u32,
    pub secs_since_last_message: Option<u64>,
}

/// Link bookkeeping owned by the session task.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    status: LinkStatus,
    reconnects: u32,
    last_message_at: Option<Instant>,
}

impl LinkHealth {
    pub fn new() -> Self {
        Self {
            status: LinkStatus::Connecting,
            reconnects: 0,
            last_message_at: None,
        }
    }

    pub fn mark_connected(&mut self) {
        if self.status == LinkStatus::Reconnecting || self.status == LinkStatus::Disconnected {
            self.reconnects += 1;
        }
        self.status = LinkStatus::Connected;
    }

    pub fn mark_lost(&mut self) {
        self.status = LinkStatus::Reconnecting;
    }

    pub fn mark_disconnected(&mut self) {
        self.status = LinkStatus::Disconnected;
    }

    pub fn record_message(&mut self, now: Instant) {
        self.last_message_at = Some(now);
    }

    /// True when a message arrived within `grace` of `now`.
    pub fn should_ignore_disconnect(&self, now: Instant, grace: Duration) -> bool {
        match self.last_message_at {
            Some(at) => now.saturating_duration_since(at) < grace,
            None => false,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn report(&self, now: Instant) -> LinkHealthReport {
        LinkHealthReport {
            status: self.status,
            reconnects: self.reconnects,
            secs_since_last_message: self
                .last_message_at
                .map(|at| now.saturating_duration_since(at).as_secs()),
        }
    }
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_module_and_severity_bits() {
        let alerts = decode_alerts(&json!([
            { "attr": 0x0300_0100u64, "code": 0x0C02_0001u64 },
            { "code": "0x05010000" },
            { "code": "not-hex" },
            "garbage"
        ]));

        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].code, "0xc020001");
        assert_eq!(alerts[0].module, 0x0C);
        assert_eq!(alerts[0].severity, 2);
        assert_eq!(alerts[1].module, 0x05);
        assert_eq!(alerts[1].severity, 1);
        assert_eq!(alerts[2].severity, 3);
        assert_eq!(alerts[2].module, 0);
    }

    #[test]
    fn zero_severity_falls_back_to_common() {
        let alerts = decode_alerts(&json!([{ "attr": "0x07000000" }]));
        assert_eq!(alerts[0].module, 7);
        assert_eq!(severity_label(alerts[0].severity), "common");
    }

    #[test]
    fn non_array_yields_nothing() {
        assert!(decode_alerts(&json!({ "code": 1 })).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recent_message_suppresses_disconnect() {
        let mut link = LinkHealth::new();
        let grace = Duration::from_secs(30);
        assert!(!link.should_ignore_disconnect(Instant::now(), grace));

        link.record_message(Instant::now());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(link.should_ignore_disconnect(Instant::now(), grace));

        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(!link.should_ignore_disconnect(Instant::now(), grace));
    }

    #[test]
    fn reconnect_counter_increments_after_loss() {
        let mut link = LinkHealth::new();
        link.mark_connected();
        link.mark_lost();
        link.mark_connected();
        let report = link.report(Instant::now());
        assert_eq!(report.reconnects, 1);
        assert_eq!(report.status, LinkStatus::Connected);
    }
}
