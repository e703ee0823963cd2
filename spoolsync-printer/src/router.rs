/**
 * ROUTER - Aiguillage des rapports et agrégation de l'état
 *
 * RÔLE :
 * Chaque rapport JSON de l'imprimante est partiel. Le routeur distribue les
 * sections de premier niveau (`ams`, `xcam`, `system`, `print`) et ne met à
 * jour que les champs présents dans `DeviceState`.
 *
 * FONCTIONNEMENT :
 * - `ams` : normalisation, stockage dans `raw.ams`, détection de changement
 * - `xcam` : drapeaux live view / timelapse ("enable" = actif)
 * - `system` : diagnostic seulement (réponses accessoires non fiables)
 * - `print` : champs de job, températures (tous les alias matériels),
 *   alertes HMS, buses, réponse de calibration, puis cycle d'impression
 * - `raw` conserve les données AMS / vt_tray envoyées par intermittence
 */

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::ams::{self, AmsChangeDetector};
use crate::calibration::{self, CalibrationReply};
use crate::events::{PrintJob, PrinterEvent};
use crate::health::decode_alerts;
use crate::lifecycle::{LifecycleEvent, PrintLifecycle};
use crate::models::{DeviceState, PrintStatus};

/// Result of routing one report.
#[derive(Debug, Default)]
pub struct RouteOutcome {
    /// AMS and lifecycle events, in emission order.
    pub events: Vec<PrinterEvent>,
    pub state_changed: bool,
    pub calibration: Option<CalibrationReply>,
}

pub struct ReportRouter {
    serial: String,
    lifecycle: PrintLifecycle,
    ams: AmsChangeDetector,
}

impl ReportRouter {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            lifecycle: PrintLifecycle::new(),
            ams: AmsChangeDetector::new(),
        }
    }

    /// Resumes from a previously saved lifecycle state. AMS tracking is kept.
    pub fn set_lifecycle(&mut self, lifecycle: PrintLifecycle) {
        self.lifecycle = lifecycle;
    }

    pub fn lifecycle(&self) -> &PrintLifecycle {
        &self.lifecycle
    }

    pub fn route(&mut self, state: &mut DeviceState, payload: &Value) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();
        let Some(root) = payload.as_object() else {
            warn!("[{}] report is not a JSON object, ignored", self.serial);
            return outcome;
        };

        if let Some(ams) = root.get("ams") {
            self.handle_ams(state, ams, &mut outcome);
            outcome.state_changed = true;
        }

        if let Some(xcam) = root.get("xcam") {
            debug!("[{}] xcam: {}", self.serial, xcam);
            if let Some(xcam) = xcam.as_object() {
                if let Some(v) = xcam.get("ipcam_record") {
                    state.live_view = v.as_str() == Some("enable");
                }
                if let Some(v) = xcam.get("timelapse") {
                    state.timelapse = v.as_str() == Some("enable");
                }
                outcome.state_changed = true;
            }
        }

        if let Some(system) = root.get("system") {
            let command = system.get("command").and_then(Value::as_str).unwrap_or_default();
            if command == "get_accessories" {
                info!(
                    "[{}] accessories response (nozzle data not taken from it): {}",
                    self.serial, system
                );
            } else {
                debug!("[{}] system: {}", self.serial, system);
            }
        }

        if let Some(print) = root.get("print") {
            match print.as_object() {
                Some(section) => {
                    self.handle_print(state, section, &mut outcome);
                    outcome.state_changed = true;
                }
                None => warn!("[{}] `print` section is not an object", self.serial),
            }
        }

        outcome
    }

    fn handle_ams(&mut self, state: &mut DeviceState, payload: &Value, outcome: &mut RouteOutcome) {
        let units = match ams::normalize(payload) {
            Ok(units) => units,
            Err(e) => {
                warn!("[{}] {e}", self.serial);
                return;
            }
        };

        debug!("[{}] stored AMS data with {} units", self.serial, units.len());
        state.raw.insert("ams".into(), Value::Array(units.clone()));

        if self.ams.observe(&units) {
            info!("[{}] AMS contents changed", self.serial);
            outcome.events.push(PrinterEvent::AmsChanged { units });
        }
    }

    fn handle_print(
        &mut self,
        state: &mut DeviceState,
        data: &Map<String, Value>,
        outcome: &mut RouteOutcome,
    ) {
        if let Some(gcode_state) = data.get("gcode_state") {
            info!(
                "[{}] gcode_state: {}, gcode_file: {:?}, subtask_name: {:?}",
                self.serial,
                gcode_state,
                data.get("gcode_file"),
                data.get("subtask_name")
            );
        }

        if let Some(ams) = data.get("ams") {
            self.handle_ams(state, ams, outcome);
        }
        if let Some(vt_tray) = data.get("vt_tray") {
            state.raw.insert("vt_tray".into(), vt_tray.clone());
        }

        let section = Value::Object(data.clone());
        if calibration::is_read_response(&section) {
            let reply = calibration::parse_response(&section);
            info!("[{}] received {} calibration profiles", self.serial, reply.profiles.len());
            state.calibration_profiles = reply.profiles.clone();
            outcome.calibration = Some(reply);
        } else if let Some(command) = data.get("command").and_then(Value::as_str) {
            debug!("[{}] command response: {command}", self.serial);
        }

        apply_job_fields(state, data);
        apply_temperatures(state, data);

        if let Some(hms) = data.get("hms") {
            state.hms_alerts = decode_alerts(hms);
        }
        if let Some(v) = data.get("sdcard") {
            state.sdcard = *v == Value::Bool(true);
        }
        if let Some(v) = data.get("timelapse") {
            state.timelapse = *v == Value::Bool(true);
        }
        if let Some(v) = data.get("ipcam") {
            state.live_view = match v {
                Value::Object(cam) => {
                    cam.get("ipcam_record").and_then(Value::as_str) == Some("enable")
                }
                other => *other == Value::Bool(true),
            };
        }

        apply_nozzles(state, data);
        replace_raw(state, data);

        self.detect_lifecycle(state, section, outcome);
    }

    fn detect_lifecycle(
        &mut self,
        state: &mut DeviceState,
        section: Value,
        outcome: &mut RouteOutcome,
    ) {
        let status = state.status.clone();
        let file = state.active_file().map(str::to_string);

        match self.lifecycle.observe(&status, file.as_deref()) {
            Some(LifecycleEvent::Started { file }) => {
                info!(
                    "[{}] print started: {file} (subtask {:?})",
                    self.serial, state.subtask_name
                );
                state.hms_alerts.clear();
                outcome.events.push(PrinterEvent::PrintStarted {
                    job: PrintJob {
                        filename: file,
                        subtask_name: state.subtask_name.clone(),
                        raw: section,
                    },
                });
            }
            Some(LifecycleEvent::Completed { outcome: result, file }) => {
                info!(
                    "[{}] print {} ({status}): {:?}",
                    self.serial,
                    result.as_str(),
                    file
                );
                outcome.events.push(PrinterEvent::PrintCompleted {
                    outcome: result,
                    job: PrintJob {
                        filename: file.unwrap_or_default(),
                        subtask_name: state.subtask_name.clone(),
                        raw: section,
                    },
                });
            }
            None => {}
        }
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn apply_job_fields(state: &mut DeviceState, data: &Map<String, Value>) {
    if let Some(v) = data.get("gcode_state").and_then(Value::as_str) {
        state.status = PrintStatus::from_wire(v);
    }
    if let Some(v) = data.get("gcode_file") {
        state.gcode_file = text(v);
        state.current_print = state.gcode_file.clone();
    }
    if let Some(v) = data.get("subtask_name") {
        state.subtask_name = text(v);
        if let Some(name) = state.subtask_name.as_ref().filter(|n| !n.is_empty()) {
            state.current_print = Some(name.clone());
        }
    }
    if let Some(v) = data.get("subtask_id") {
        state.job_id = text(v);
    }
    if let Some(v) = data.get("mc_percent").and_then(number) {
        state.progress = v;
    }
    if let Some(v) = data.get("mc_remaining_time").and_then(integer) {
        state.remaining_time = Some(v);
    }
    if let Some(v) = data.get("layer_num").and_then(integer) {
        state.layer_num = Some(v);
    }
    if let Some(v) = data.get("total_layer_num").and_then(integer) {
        state.total_layers = Some(v);
    }
}

/// Canonical key, then the wire aliases in priority order.
const TEMPERATURE_FIELDS: &[(&str, &[&str])] = &[
    ("bed", &["bed_temper"]),
    ("bed_target", &["bed_target_temper"]),
    ("nozzle", &["nozzle_temper", "left_nozzle_temper"]),
    ("nozzle_target", &["nozzle_target_temper", "left_nozzle_target_temper"]),
    ("nozzle_2", &["nozzle_temper_2", "right_nozzle_temper"]),
    ("nozzle_2_target", &["nozzle_target_temper_2", "right_nozzle_target_temper"]),
    ("chamber", &["chamber_temper"]),
];

fn apply_temperatures(state: &mut DeviceState, data: &Map<String, Value>) {
    let mut temps = BTreeMap::new();
    for (key, aliases) in TEMPERATURE_FIELDS {
        if let Some(value) = aliases.iter().find_map(|alias| data.get(*alias).and_then(number)) {
            temps.insert(key.to_string(), value);
        }
    }
    // partial reports only carry what moved
    state.temperatures.extend(temps);
}

const NOZZLE_FIELDS: &[(usize, &str, &str)] = &[
    (0, "nozzle_type", "nozzle_diameter"),
    (0, "left_nozzle_type", "left_nozzle_diameter"),
    (1, "right_nozzle_type", "right_nozzle_diameter"),
    (1, "nozzle_type_2", "nozzle_diameter_2"),
];

fn apply_nozzles(state: &mut DeviceState, data: &Map<String, Value>) {
    for (index, type_key, diameter_key) in NOZZLE_FIELDS {
        if let Some(v) = data.get(*type_key).and_then(text) {
            state.nozzles[*index].nozzle_type = v;
        }
        if let Some(v) = data.get(*diameter_key).and_then(text) {
            state.nozzles[*index].diameter = v;
        }
    }
}

/// The snapshot is the latest `print` section; AMS and virtual tray data are carried over.
fn replace_raw(state: &mut DeviceState, data: &Map<String, Value>) {
    let ams = state.raw.remove("ams");
    let vt_tray = state.raw.remove("vt_tray");

    state.raw = data.clone();

    if let Some(ams) = ams {
        state.raw.insert("ams".into(), ams);
    }
    if let Some(vt_tray) = vt_tray {
        state.raw.insert("vt_tray".into(), vt_tray);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PrintOutcome;
    use serde_json::json;

    fn route(router: &mut ReportRouter, state: &mut DeviceState, payload: Value) -> RouteOutcome {
        router.route(state, &payload)
    }

    #[test]
    fn partial_updates_keep_other_fields() {
        let mut router = ReportRouter::new("S1");
        let mut state = DeviceState::default();

        route(&mut router, &mut state, json!({ "print": {
            "gcode_state": "RUNNING", "gcode_file": "benchy.3mf", "subtask_name": "Benchy",
            "mc_percent": 12, "bed_temper": 60.5, "nozzle_temper": "219.8", "layer_num": 3
        }}));
        route(
            &mut router,
            &mut state,
            json!({ "print": { "mc_percent": 40, "nozzle_temper": 220.1 } }),
        );

        assert_eq!(state.status, PrintStatus::Running);
        assert_eq!(state.current_print.as_deref(), Some("Benchy"));
        assert_eq!(state.gcode_file.as_deref(), Some("benchy.3mf"));
        assert_eq!(state.progress, 40.0);
        assert_eq!(state.layer_num, Some(3));
        assert_eq!(state.temperature("bed"), Some(60.5));
        assert_eq!(state.temperature("nozzle"), Some(220.1));
    }

    #[test]
    fn dual_nozzle_aliases_map_to_canonical_keys() {
        let mut router = ReportRouter::new("0948AD");
        let mut state = DeviceState::default();

        route(&mut router, &mut state, json!({ "print": {
            "left_nozzle_temper": 200.0, "right_nozzle_temper": 180.0,
            "right_nozzle_target_temper": 190.0,
            "left_nozzle_type": "HH01", "left_nozzle_diameter": 0.4,
            "right_nozzle_type": "HS00", "nozzle_diameter_2": "0.6"
        }}));

        assert_eq!(state.temperature("nozzle"), Some(200.0));
        assert_eq!(state.temperature("nozzle_2"), Some(180.0));
        assert_eq!(state.temperature("nozzle_2_target"), Some(190.0));
        assert_eq!(state.nozzles[0].nozzle_type, "HH01");
        assert_eq!(state.nozzles[0].diameter, "0.4");
        assert_eq!(state.nozzles[1].nozzle_type, "HS00");
        assert_eq!(state.nozzles[1].diameter, "0.6");
        assert_eq!(state.nozzle_count(), 2);
    }

    #[test]
    fn primary_nozzle_field_wins_over_left_alias() {
        let mut router = ReportRouter::new("S1");
        let mut state = DeviceState::default();
        let report = json!({ "print": { "nozzle_temper": 210.0, "left_nozzle_temper": 150.0 } });
        route(&mut router, &mut state, report);
        assert_eq!(state.temperature("nozzle"), Some(210.0));
    }

    #[test]
    fn ams_and_vt_tray_survive_later_reports() {
        let mut router = ReportRouter::new("S1");
        let mut state = DeviceState::default();

        let first = route(&mut router, &mut state, json!({ "print": {
            "ams": {
                "ams": [{ "id": "0", "tray": [{ "id": "0", "tray_type": "PLA", "remain": 50 }] }],
                "tray_now": "0"
            },
            "vt_tray": { "id": "254", "tray_type": "PETG" }
        }}));
        assert!(matches!(first.events.as_slice(), [PrinterEvent::AmsChanged { .. }]));

        route(
            &mut router,
            &mut state,
            json!({ "print": { "mc_percent": 5, "wifi_signal": "-40dBm" } }),
        );

        assert_eq!(state.ams_units().len(), 1);
        assert_eq!(state.virtual_tray().unwrap()["tray_type"], "PETG");
        assert_eq!(state.raw["wifi_signal"], "-40dBm");
    }

    #[test]
    fn raw_snapshot_holds_only_the_latest_report() {
        let mut router = ReportRouter::new("S1");
        let mut state = DeviceState::default();

        route(&mut router, &mut state, json!({ "ams": [{ "id": "0", "tray": [] }] }));
        route(&mut router, &mut state, json!({ "print": {
            "command": "extrusion_cali_get",
            "nozzle_diameter": "0.4",
            "filaments": [{ "filament_id": "GFA00", "name": "PLA", "k_value": "0.020000" }]
        }}));
        assert_eq!(state.raw["command"], "extrusion_cali_get");

        route(&mut router, &mut state, json!({ "print": { "mc_percent": 12 } }));

        assert!(state.raw.get("command").is_none());
        assert!(state.raw.get("filaments").is_none());
        assert_eq!(state.raw["mc_percent"], 12);
        assert_eq!(state.ams_units().len(), 1);
        // parsed values outlive the snapshot
        assert_eq!(state.calibration_profiles.len(), 1);
    }

    #[test]
    fn unexpected_ams_shape_is_ignored() {
        let mut router = ReportRouter::new("S1");
        let mut state = DeviceState::default();
        let outcome = route(
            &mut router,
            &mut state,
            json!({ "ams": "broken", "print": { "mc_percent": 1 } }),
        );
        assert!(outcome.events.is_empty());
        assert!(state.ams_units().is_empty());
        assert_eq!(state.progress, 1.0);
    }

    #[test]
    fn xcam_and_print_flags() {
        let mut router = ReportRouter::new("S1");
        let mut state = DeviceState::default();

        route(
            &mut router,
            &mut state,
            json!({ "xcam": { "ipcam_record": "enable", "timelapse": "disable" } }),
        );
        assert!(state.live_view);
        assert!(!state.timelapse);

        route(&mut router, &mut state, json!({ "print": {
            "sdcard": true, "timelapse": "true", "ipcam": { "ipcam_record": "disable" }
        }}));
        assert!(state.sdcard);
        assert!(!state.timelapse);
        assert!(!state.live_view);
    }

    #[test]
    fn start_clears_alerts_and_finish_completes() {
        let mut router = ReportRouter::new("S1");
        let mut state = DeviceState::default();

        route(
            &mut router,
            &mut state,
            json!({ "print": { "gcode_state": "IDLE", "hms": [{ "attr": 1, "code": 0x0C020001u64 }] } }),
        );
        assert_eq!(state.hms_alerts.len(), 1);

        let start = route(
            &mut router,
            &mut state,
            json!({ "print": { "gcode_state": "RUNNING", "gcode_file": "a.3mf" } }),
        );
        assert!(state.hms_alerts.is_empty());
        match start.events.as_slice() {
            [PrinterEvent::PrintStarted { job }] => assert_eq!(job.filename, "a.3mf"),
            other => panic!("unexpected events: {other:?}"),
        }

        let done = route(&mut router, &mut state, json!({ "print": { "gcode_state": "FINISH" } }));
        match done.events.as_slice() {
            [PrinterEvent::PrintCompleted { outcome, job }] => {
                assert_eq!(*outcome, PrintOutcome::Completed);
                assert_eq!(job.filename, "a.3mf");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn calibration_response_replaces_profiles() {
        let mut router = ReportRouter::new("S1");
        let mut state = DeviceState::default();

        let outcome = route(&mut router, &mut state, json!({ "print": {
            "command": "extrusion_cali_get", "nozzle_diameter": "0.4",
            "filaments": [{ "name": "A" }, { "name": "B" }]
        }}));
        assert_eq!(state.calibration_profiles.len(), 2);
        assert!(outcome.calibration.is_some());

        route(&mut router, &mut state, json!({ "print": {
            "command": "extrusion_cali_get", "nozzle_diameter": "0.4", "filaments": []
        }}));
        assert!(state.calibration_profiles.is_empty());
    }

    #[test]
    fn non_object_report_is_dropped() {
        let mut router = ReportRouter::new("S1");
        let mut state = DeviceState::default();
        let outcome = route(&mut router, &mut state, json!([1, 2, 3]));
        assert!(!outcome.state_changed);
    }
}
