/*!
Replay de captures MQTT

Une capture est le journal de messages d'un `PrinterClient` (`client.logs()`)
sauvegardé en JSON. Les messages entrants sont rejoués dans un `TestHarness`
pour reproduire une séquence réelle (début / fin d'impression, AMS...).
*/

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spoolsync_printer::message_log::{Direction, LogEntry};
use std::path::Path;

use crate::test_utils::TestHarness;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub serial: String,
    pub recorded_at: DateTime<Utc>,
    pub entries: Vec<LogEntry>,
}

impl Capture {
    pub fn new(serial: impl Into<String>, entries: Vec<LogEntry>) -> Self {
        Self {
            serial: serial.into(),
            recorded_at: Utc::now(),
            entries,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading capture {}", path.display()))?;
        let capture = serde_json::from_str(&text)
            .with_context(|| format!("parsing capture {}", path.display()))?;
        Ok(capture)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing capture {}", path.display()))?;
        Ok(())
    }

    pub fn inbound(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| e.direction == Direction::Inbound)
    }

    /// Feeds every inbound report to the harness, in order. Returns the count.
    pub async fn replay(&self, harness: &TestHarness) -> Result<usize> {
        let mut count = 0;
        for entry in self.inbound() {
            harness.deliver(&entry.payload).await?;
            count += 1;
        }
        log::info!("🔁 Replayed {} reports from capture of {}", count, self.serial);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_stub::ReportBuilder;
    use spoolsync_printer::PrinterEvent;

    fn entry(direction: Direction, payload: serde_json::Value) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            topic: "device/S/report".into(),
            direction,
            payload,
        }
    }

    #[test]
    fn test_capture_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captures/run.json");

        let capture = Capture::new(
            "S",
            vec![
                entry(Direction::Outbound, ReportBuilder::progress(0, 0)),
                entry(Direction::Inbound, ReportBuilder::print_status("RUNNING", Some("a.3mf"))),
            ],
        );
        capture.save(&path).unwrap();

        let loaded = Capture::load(&path).unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.inbound().count(), 1);
    }

    #[test]
    fn test_missing_capture_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Capture::load(dir.path().join("nope.json")).is_err());
    }

    #[tokio::test]
    async fn test_replay_reproduces_print_cycle() {
        let mut harness = TestHarness::new().unwrap();
        harness.connect().await.unwrap();

        let capture = Capture::new(
            harness.client.serial(),
            vec![
                entry(Direction::Inbound, ReportBuilder::print_status("RUNNING", Some("cube.3mf"))),
                entry(Direction::Outbound, ReportBuilder::progress(1, 1)),
                entry(Direction::Inbound, ReportBuilder::progress(50, 10)),
                entry(Direction::Inbound, ReportBuilder::print_status("FINISH", None)),
            ],
        );

        assert_eq!(capture.replay(&harness).await.unwrap(), 3);
        let edges = harness.drain_edges();
        assert!(matches!(edges[0], PrinterEvent::PrintStarted { .. }));
        assert!(matches!(edges[1], PrinterEvent::PrintCompleted { .. }));
        assert_eq!(edges.len(), 2);
    }
}
