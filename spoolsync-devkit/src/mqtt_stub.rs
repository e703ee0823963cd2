/*!
Mock MQTT Client pour tester un `PrinterClient` sans imprimante ni broker

Enregistre tout ce que la session publie (commandes, souscriptions) et
fournit des builders pour les rapports que l'imprimante enverrait.
*/

use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::{json, Value};
use spoolsync_printer::{Publisher, PrinterError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl MockMessage {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Publisher that records instead of sending.
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    fail_publish: Arc<AtomicBool>,
    disconnects: Arc<AtomicUsize>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following publish fail as if the request channel were closed.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Published payloads whose section carries `"command": <command>`.
    pub fn messages_with_command(&self, command: &str) -> Vec<Value> {
        self.published_messages
            .lock()
            .iter()
            .filter_map(MockMessage::json)
            .filter(|payload| command_of(payload) == Some(command))
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
        self.subscriptions.lock().clear();
    }
}

/// `command` field of the first section (`print`, `pushing`, `system`, `xcam`).
pub fn command_of(payload: &Value) -> Option<&str> {
    payload
        .as_object()?
        .values()
        .find_map(|section| section.get("command").and_then(Value::as_str))
}

impl Publisher for MockMqttClient {
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> spoolsync_printer::Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(PrinterError::NotConnected("mock publish disabled".into()));
        }
        log::info!("📤 [MOCK] Published to {}: {} bytes", topic, payload.len());
        self.published_messages.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str, _qos: QoS) -> spoolsync_printer::Result<()> {
        log::info!("📥 [MOCK] Subscribed to {}", topic);
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    fn disconnect(&self) -> spoolsync_printer::Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builders for reports as the printer sends them.
pub struct ReportBuilder;

impl ReportBuilder {
    /// `print` section with a status and, optionally, the active file.
    pub fn print_status(gcode_state: &str, file: Option<&str>) -> Value {
        let mut print = json!({ "gcode_state": gcode_state });
        if let Some(file) = file {
            print["gcode_file"] = json!(file);
            print["subtask_name"] = json!(file.trim_end_matches(".3mf"));
        }
        json!({ "print": print })
    }

    pub fn progress(percent: u32, remaining_minutes: u32) -> Value {
        json!({ "print": { "mc_percent": percent, "mc_remaining_time": remaining_minutes } })
    }

    /// Top-level AMS report. Trays: `(unit id, tray id, type, tag uid, remain)`.
    pub fn ams(trays: &[(&str, &str, &str, &str, i64)]) -> Value {
        let mut units: Vec<Value> = Vec::new();
        for (unit_id, tray_id, tray_type, tag_uid, remain) in trays {
            let tray = json!({
                "id": tray_id,
                "tray_type": tray_type,
                "tag_uid": tag_uid,
                "remain": remain,
            });
            match units.iter().position(|u| u["id"] == json!(unit_id)) {
                Some(pos) => {
                    if let Some(list) = units[pos]["tray"].as_array_mut() {
                        list.push(tray);
                    }
                }
                None => units.push(json!({ "id": unit_id, "humidity": "4", "tray": [tray] })),
            }
        }
        json!({ "ams": units })
    }

    /// `extrusion_cali_get` answer. Profiles: `(filament id, name, k value)`.
    pub fn calibration_response(nozzle_diameter: &str, profiles: &[(&str, &str, &str)]) -> Value {
        let filaments: Vec<Value> = profiles
            .iter()
            .enumerate()
            .map(|(idx, (filament_id, name, k_value))| {
                json!({
                    "cali_idx": idx,
                    "extruder_id": 0,
                    "filament_id": filament_id,
                    "k_value": k_value,
                    "n_coef": "0.000000",
                    "name": name,
                    "nozzle_diameter": nozzle_diameter,
                    "nozzle_id": format!("HS00-{nozzle_diameter}"),
                    "setting_id": format!("PFUS{idx:014x}"),
                })
            })
            .collect();

        json!({
            "print": {
                "command": "extrusion_cali_get",
                "filaments": filaments,
                "nozzle_diameter": nozzle_diameter,
                "reason": "success",
                "result": "success",
                "sequence_id": "0",
            }
        })
    }

    pub fn xcam(live_view: bool, timelapse: bool) -> Value {
        let flag = |on: bool| if on { "enable" } else { "disable" };
        json!({ "xcam": { "ipcam_record": flag(live_view), "timelapse": flag(timelapse) } })
    }

    pub fn hms(codes: &[u64]) -> Value {
        let entries: Vec<Value> = codes.iter().map(|c| json!({ "attr": 0, "code": c })).collect();
        json!({ "print": { "hms": entries } })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_client_records_publish_and_subscribe() {
        let client = MockMqttClient::new();
        client.subscribe("device/S1/report", QoS::AtMostOnce).unwrap();
        assert_eq!(client.get_subscriptions(), vec!["device/S1/report"]);

        let payload = serde_json::to_vec(&json!({ "pushing": { "command": "pushall" } })).unwrap();
        client.publish("device/S1/request", QoS::AtMostOnce, payload).unwrap();

        assert_eq!(client.find_messages_by_topic("device/S1/request").len(), 1);
        assert_eq!(client.messages_with_command("pushall").len(), 1);
        let last: Option<Value> = client.get_last_json_message("device/S1/request").unwrap();
        assert_eq!(last.unwrap()["pushing"]["command"], "pushall");
    }

    #[test]
    fn test_failing_publish() {
        let client = MockMqttClient::new();
        client.set_fail_publish(true);
        assert!(client.publish("t", QoS::AtMostOnce, b"{}".to_vec()).is_err());
        assert!(client.get_published_messages().is_empty());
    }

    #[test]
    fn test_report_builders() {
        let ams = ReportBuilder::ams(&[
            ("0", "0", "PLA", "A1", 90),
            ("0", "1", "PETG", "B2", 40),
            ("1", "0", "ABS", "", -1),
        ]);
        let units = ams["ams"].as_array().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0]["tray"].as_array().unwrap().len(), 2);

        let cali = ReportBuilder::calibration_response("0.4", &[("GFA00", "PLA", "0.020000")]);
        assert_eq!(command_of(&cali), Some("extrusion_cali_get"));
        assert_eq!(cali["print"]["filaments"][0]["setting_id"], "PFUS00000000000000");
    }
}
