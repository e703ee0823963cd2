/*!
Test Harness pour la session imprimante

Branche un `PrinterClient` réel sur un `MockMqttClient` :
- injection des événements transport (connexion, perte, rapports)
- attente d'état / d'événements avec timeout
- assertions sur les commandes publiées

Prévu pour le runtime `current_thread` de `#[tokio::test]` : après `deliver`,
le rapport a été entièrement traité par la tâche de session.
*/

use crate::mqtt_stub::{command_of, MockMqttClient};
use anyhow::{Context, Result};
use serde_json::Value;
use spoolsync_printer::{DeviceState, PrinterClient, PrinterConfig, PrinterEvent, TransportEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

pub const DEFAULT_SERIAL: &str = "01P00A000000001";
pub const DUAL_SERIAL: &str = "0948AD000000001";

pub struct TestHarness {
    pub client: PrinterClient,
    pub mqtt_client: MockMqttClient,
    transport: mpsc::Sender<TransportEvent>,
    events: broadcast::Receiver<PrinterEvent>,
}

impl TestHarness {
    /// Must be called inside a tokio runtime (spawns the session task).
    pub fn new() -> Result<Self> {
        Self::with_serial(DEFAULT_SERIAL)
    }

    pub fn with_serial(serial: &str) -> Result<Self> {
        Self::with_config(PrinterConfig::new("127.0.0.1", serial, "12345678"))
    }

    pub fn with_config(config: PrinterConfig) -> Result<Self> {
        env_logger::builder().is_test(true).try_init().ok();

        let client = PrinterClient::new(config).context("invalid test config")?;
        let mqtt_client = MockMqttClient::new();
        let events = client.subscribe();
        let transport = client.attach(Arc::new(mqtt_client.clone()));

        Ok(Self {
            client,
            mqtt_client,
            transport,
            events,
        })
    }

    pub fn report_topic(&self) -> String {
        format!("device/{}/report", self.client.serial())
    }

    pub fn request_topic(&self) -> String {
        format!("device/{}/request", self.client.serial())
    }

    async fn push(&self, event: TransportEvent) -> Result<()> {
        self.transport.send(event).await.context("session task is gone")?;
        self.flush().await;
        Ok(())
    }

    /// Yields until the session task has drained the transport channel.
    pub async fn flush(&self) {
        while self.transport.capacity() < self.transport.max_capacity() {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
    }

    /// Simulates a successful CONNACK and drops the connect-time events.
    pub async fn connect(&mut self) -> Result<()> {
        self.push(TransportEvent::Connected).await?;
        anyhow::ensure!(self.client.is_connected(), "client did not report connected");
        self.drain_events();
        log::info!("🔌 Harness connected as {}", self.client.serial());
        Ok(())
    }

    pub async fn drop_connection(&self, reason: &str) -> Result<()> {
        self.push(TransportEvent::ConnectionLost(reason.to_string())).await
    }

    /// Delivers a report on the printer's report topic.
    pub async fn deliver(&self, payload: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.deliver_raw(&self.report_topic(), bytes).await
    }

    pub async fn deliver_raw(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.push(TransportEvent::Message {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    /// Events received so far, without waiting.
    pub fn drain_events(&mut self) -> Vec<PrinterEvent> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("⚠️ Harness lagged {} events", n);
                }
                Err(_) => break,
            }
        }
        out
    }

    /// Events other than state snapshots, in order.
    pub fn drain_edges(&mut self) -> Vec<PrinterEvent> {
        self.drain_events()
            .into_iter()
            .filter(|e| !matches!(e, PrinterEvent::StateChanged { .. }))
            .collect()
    }

    pub async fn next_event(&mut self, timeout_ms: u64) -> Result<PrinterEvent> {
        let event = timeout(Duration::from_millis(timeout_ms), self.events.recv())
            .await
            .context("timeout waiting for printer event")??;
        Ok(event)
    }

    pub async fn wait_for_state<F>(&self, timeout_ms: u64, predicate: F) -> Result<DeviceState>
    where
        F: Fn(&DeviceState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let state = self.client.state();
            if predicate(&state) {
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("state condition not met within {timeout_ms}ms");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Published payloads carrying the given command name.
    pub fn sent_commands(&self, command: &str) -> Vec<Value> {
        self.mqtt_client.messages_with_command(command)
    }

    /// Waits until at least `count` payloads with `command` were published.
    pub async fn wait_for_command(
        &self,
        command: &str,
        count: usize,
        timeout_ms: u64,
    ) -> Result<Vec<Value>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let sent = self.sent_commands(command);
            if sent.len() >= count {
                log::info!("✅ Found {} `{}` commands", sent.len(), command);
                return Ok(sent);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("expected {count} `{command}` commands, got {}", sent.len());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Asserts a dotted path in the last payload published on the request topic.
    pub fn assert_field_equals(&self, field_path: &str, expected: &Value) -> Result<()> {
        let topic = self.request_topic();
        let msg = self
            .mqtt_client
            .get_last_json_message::<Value>(&topic)?
            .with_context(|| format!("nothing published on {topic}"))?;

        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {:?}, got {:?}",
                field_path,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in {}", field_path, msg),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut command_counts = HashMap::new();
        for payload in messages.iter().filter_map(|m| m.json()) {
            let name = command_of(&payload).unwrap_or("?").to_string();
            *command_counts.entry(name).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            command_counts,
            subscriptions: self.mqtt_client.get_subscriptions(),
        }
    }

    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.drain_events();
        log::info!("🧹 Test harness reset");
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub command_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}

impl TestStats {
    pub fn print(&self) {
        println!("📊 Test Statistics:");
        println!("  Total messages: {}", self.total_messages);
        for (command, count) in &self.command_counts {
            println!("    {}: {} messages", command, count);
        }
        println!("  Subscriptions: {:?}", self.subscriptions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_harness_connect_sends_startup_messages() {
        let mut harness = TestHarness::new().unwrap();
        harness.connect().await.unwrap();

        let stats = harness.get_stats();
        assert_eq!(stats.subscriptions, vec![harness.report_topic()]);
        assert_eq!(stats.command_counts.get("pushall"), Some(&1));
        assert_eq!(stats.command_counts.get("extrusion_cali_get"), Some(&1));
        harness
            .assert_field_equals("print.nozzle_diameter", &json!("0.4"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_nested_field_lookup() {
        let value = json!({ "print": { "filaments": [{ "name": "PLA" }] } });
        assert_eq!(get_nested_field(&value, "print.filaments.0.name"), Some(&json!("PLA")));
        assert!(get_nested_field(&value, "print.missing").is_none());
    }
}
