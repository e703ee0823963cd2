/**
 * CALIBRATION - Profils pressure-advance (K) stockés sur l'imprimante
 *
 * RÔLE :
 * Builders des messages `extrusion_cali_get|set|del` selon la famille matérielle,
 * parsing des réponses, et rendez-vous one-shot entre la lecture en attente et
 * la tâche de session qui reçoit la réponse.
 *
 * FONCTIONNEMENT :
 * - L'imprimante ne renvoie pas le sequence_id : la première réponse
 *   `extrusion_cali_get` reçue répond à la lecture en cours
 * - Un seul emplacement d'attente par imprimante ; un second enregistrement
 *   est refusé (les appels sont mis en file par le client)
 */

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{PrinterError, Result};
use crate::family::DeviceFamily;
use crate::models::CalibrationProfile;

pub const READ_COMMAND: &str = "extrusion_cali_get";
pub const WRITE_COMMAND: &str = "extrusion_cali_set";
pub const DELETE_COMMAND: &str = "extrusion_cali_del";

const DUAL_N_COEF: &str = "0.000000";
const SINGLE_N_COEF: &str = "1.000000";
const SETTING_ID_PREFIX: &str = "PFUS";

/// Parameters of a profile create or edit.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileWrite {
    pub filament_id: String,
    pub name: String,
    pub k_value: String,
    pub nozzle_diameter: String,
    pub nozzle_id: String,
    pub extruder_id: i64,
    pub setting_id: Option<String>,
    pub slot_id: i64,
    /// Existing slot being edited in place (dual-extruder family).
    pub cali_idx: Option<i64>,
}

impl ProfileWrite {
    pub fn new(
        filament_id: impl Into<String>,
        name: impl Into<String>,
        k_value: impl Into<String>,
    ) -> Self {
        Self {
            filament_id: filament_id.into(),
            name: name.into(),
            k_value: k_value.into(),
            nozzle_diameter: "0.4".into(),
            nozzle_id: "HS00-0.4".into(),
            extruder_id: 0,
            setting_id: None,
            slot_id: 0,
            cali_idx: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDelete {
    pub cali_idx: i64,
    pub filament_id: String,
    pub nozzle_id: String,
    pub nozzle_diameter: String,
    pub extruder_id: i64,
    pub setting_id: Option<String>,
}

/// Decoded `extrusion_cali_get` response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationReply {
    pub nozzle_diameter: Option<String>,
    pub profiles: Vec<CalibrationProfile>,
}

pub fn read_request(sequence_id: u64, nozzle_diameter: &str) -> Value {
    json!({
        "print": {
            "command": READ_COMMAND,
            "filament_id": "",
            "nozzle_diameter": nozzle_diameter,
            "sequence_id": sequence_id.to_string(),
        }
    })
}

fn new_setting_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{SETTING_ID_PREFIX}{}", &hex[..14])
}

pub fn write_request(family: DeviceFamily, sequence_id: u64, profile: &ProfileWrite) -> Value {
    let setting_id = match (&profile.cali_idx, profile.setting_id.as_deref()) {
        (Some(_), _) => Some(String::new()),
        (None, None | Some("")) if profile.slot_id == 0 => Some(new_setting_id()),
        (None, other) => other.map(str::to_string),
    };

    // keys are listed alphabetically, matching what the firmware expects
    let entry = if family.is_dual() {
        let mut entry = json!({
            "ams_id": 0,
            "extruder_id": profile.extruder_id,
            "filament_id": profile.filament_id,
            "k_value": profile.k_value,
            "n_coef": DUAL_N_COEF,
            "name": profile.name,
            "nozzle_diameter": profile.nozzle_diameter,
            "nozzle_id": profile.nozzle_id,
            "setting_id": setting_id.unwrap_or_default(),
            "slot_id": profile.slot_id,
            "tray_id": -1,
        });
        if let (Some(idx), Some(map)) = (profile.cali_idx, entry.as_object_mut()) {
            map.insert("cali_idx".into(), json!(idx));
            map.insert("slot_id".into(), json!(0));
        }
        entry
    } else {
        json!({
            "ams_id": 0,
            "extruder_id": 0,
            "filament_id": profile.filament_id,
            "k_value": profile.k_value,
            "n_coef": SINGLE_N_COEF,
            "name": profile.name,
            "nozzle_diameter": profile.nozzle_diameter,
            "nozzle_id": "",
            "setting_id": setting_id,
            "slot_id": profile.slot_id,
            "tray_id": -1,
        })
    };

    json!({
        "print": {
            "command": WRITE_COMMAND,
            "filaments": [entry],
            "nozzle_diameter": profile.nozzle_diameter,
            "sequence_id": sequence_id.to_string(),
        }
    })
}

pub fn delete_request(family: DeviceFamily, sequence_id: u64, profile: &ProfileDelete) -> Value {
    if family.is_dual() {
        json!({
            "print": {
                "command": DELETE_COMMAND,
                "sequence_id": sequence_id.to_string(),
                "extruder_id": profile.extruder_id,
                "nozzle_id": profile.nozzle_id,
                "filament_id": profile.filament_id,
                "cali_idx": profile.cali_idx,
                "nozzle_diameter": profile.nozzle_diameter,
            }
        })
    } else {
        json!({
            "print": {
                "command": DELETE_COMMAND,
                "sequence_id": sequence_id.to_string(),
                "filament_id": profile.filament_id,
                "cali_idx": profile.cali_idx,
                "setting_id": profile.setting_id,
                "nozzle_diameter": profile.nozzle_diameter,
            }
        })
    }
}

pub fn is_read_response(print: &Value) -> bool {
    print.get("command").and_then(Value::as_str) == Some(READ_COMMAND)
}

pub fn parse_response(print: &Value) -> CalibrationReply {
    let nozzle_diameter = print.get("nozzle_diameter").and_then(scalar_text);
    let filaments = print.get("filaments").and_then(Value::as_array);

    let profiles = filaments
        .into_iter()
        .flatten()
        .enumerate()
        .filter_map(|(index, entry)| {
            let map = entry.as_object()?;
            let profile = parse_profile(index, map);
            if profile.is_none() {
                warn!(index, "skipping malformed calibration profile");
            }
            profile
        })
        .collect();

    CalibrationReply {
        nozzle_diameter,
        profiles,
    }
}

fn parse_profile(index: usize, f: &Map<String, Value>) -> Option<CalibrationProfile> {
    let int = |key: &str, default: i64| match f.get(key) {
        None | Some(Value::Null) => Some(default),
        Some(v) => scalar_int(v),
    };
    let text = |key: &str, default: &str| {
        f.get(key).and_then(scalar_text).unwrap_or_else(|| default.to_string())
    };

    Some(CalibrationProfile {
        slot_id: int("cali_idx", index as i64)?,
        extruder_id: int("extruder_id", 0)?,
        nozzle_id: text("nozzle_id", ""),
        nozzle_diameter: text("nozzle_diameter", "0.4"),
        filament_id: text("filament_id", ""),
        name: text("name", ""),
        k_value: text("k_value", "0.000000"),
        n_coef: text("n_coef", "0.000000"),
        ams_id: int("ams_id", 0)?,
        tray_id: int("tray_id", -1)?,
        setting_id: f.get("setting_id").and_then(scalar_text),
    })
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn same_diameter(a: &str, b: &str) -> bool {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => (x - y).abs() < 1e-6,
        _ => a == b,
    }
}

struct PendingRead {
    nozzle_diameter: String,
    tx: oneshot::Sender<Vec<CalibrationProfile>>,
}

/// Single waiter slot for the outstanding calibration read.
#[derive(Default)]
pub struct CalibrationWaiter {
    slot: Mutex<Option<PendingRead>>,
}

impl CalibrationWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a read; fails if another live read holds the slot.
    pub fn register(
        &self,
        nozzle_diameter: &str,
    ) -> Result<oneshot::Receiver<Vec<CalibrationProfile>>> {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|pending| !pending.tx.is_closed()) {
            return Err(PrinterError::CalibrationBusy);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(PendingRead {
            nozzle_diameter: nozzle_diameter.to_string(),
            tx,
        });
        Ok(rx)
    }

    /// Hands the reply to the pending read, if any and if it matches.
    pub fn resolve(&self, reply: &CalibrationReply) -> bool {
        let mut slot = self.slot.lock();
        let matches = match (slot.as_ref(), reply.nozzle_diameter.as_deref()) {
            (None, _) => return false,
            (Some(_), None) => true,
            (Some(pending), Some(d)) => same_diameter(&pending.nozzle_diameter, d),
        };
        if !matches {
            debug!(
                reply = ?reply.nozzle_diameter,
                "calibration reply for another nozzle, still waiting"
            );
            return false;
        }
        match slot.take() {
            Some(pending) => pending.tx.send(reply.profiles.clone()).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self) {
        self.slot.lock().take();
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Clears the slot when the returned guard goes out of scope.
    pub fn guard(&self) -> WaiterGuard<'_> {
        WaiterGuard { waiter: self }
    }
}

pub struct WaiterGuard<'a> {
    waiter: &'a CalibrationWaiter,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiter.cancel();
    }
}
