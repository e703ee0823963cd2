use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Coarse print status reported in `print.gcode_state`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PrintStatus {
    Idle,
    Prepare,
    Running,
    Pause,
    Finish,
    Failed,
    Slicing,
    Other(String),
    #[default]
    Unknown,
}

impl PrintStatus {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "IDLE" => PrintStatus::Idle,
            "PREPARE" => PrintStatus::Prepare,
            "RUNNING" => PrintStatus::Running,
            "PAUSE" => PrintStatus::Pause,
            "FINISH" => PrintStatus::Finish,
            "FAILED" => PrintStatus::Failed,
            "SLICING" => PrintStatus::Slicing,
            "" | "unknown" => PrintStatus::Unknown,
            other => PrintStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PrintStatus::Idle => "IDLE",
            PrintStatus::Prepare => "PREPARE",
            PrintStatus::Running => "RUNNING",
            PrintStatus::Pause => "PAUSE",
            PrintStatus::Finish => "FINISH",
            PrintStatus::Failed => "FAILED",
            PrintStatus::Slicing => "SLICING",
            PrintStatus::Other(s) => s,
            PrintStatus::Unknown => "unknown",
        }
    }
}

impl From<String> for PrintStatus {
    fn from(s: String) -> Self {
        PrintStatus::from_wire(&s)
    }
}

impl From<PrintStatus> for String {
    fn from(s: PrintStatus) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for PrintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active health (HMS) alert decoded from the device's code layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub code: String,
    pub module: u32,
    /// 1 = fatal, 2 = serious, 3 = common, 4 = info
    pub severity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NozzleDescriptor {
    pub nozzle_type: String,
    pub diameter: String,
}

/// Pressure-advance calibration profile stored on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub slot_id: i64,
    pub extruder_id: i64,
    pub nozzle_id: String,
    pub nozzle_diameter: String,
    pub filament_id: String,
    pub name: String,
    pub k_value: String,
    pub n_coef: String,
    pub ams_id: i64,
    pub tray_id: i64,
    pub setting_id: Option<String>,
}

/// Aggregated view of one printer, rebuilt incrementally from partial reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceState {
    pub connected: bool,
    pub status: PrintStatus,
    pub gcode_file: Option<String>,
    pub subtask_name: Option<String>,
    /// Display name of the job: subtask name when set, file name otherwise.
    pub current_print: Option<String>,
    pub job_id: Option<String>,
    pub progress: f64,
    pub remaining_time: Option<i64>,
    pub layer_num: Option<i64>,
    pub total_layers: Option<i64>,
    pub temperatures: BTreeMap<String, f64>,
    pub hms_alerts: Vec<HealthAlert>,
    pub calibration_profiles: Vec<CalibrationProfile>,
    pub sdcard: bool,
    pub timelapse: bool,
    pub live_view: bool,
    pub nozzles: [NozzleDescriptor; 2],
    pub raw: Map<String, Value>,
}

impl DeviceState {
    /// File the lifecycle detector keys on.
    pub fn active_file(&self) -> Option<&str> {
        self.gcode_file
            .as_deref()
            .filter(|f| !f.is_empty())
            .or(self.current_print.as_deref())
    }

    /// 2 when the second nozzle reports a type, diameter or temperature.
    pub fn nozzle_count(&self) -> usize {
        let second = &self.nozzles[1];
        if !second.nozzle_type.is_empty()
            || !second.diameter.is_empty()
            || self.temperatures.contains_key("nozzle_2")
        {
            2
        } else {
            1
        }
    }

    pub fn ams_units(&self) -> &[Value] {
        self.raw
            .get("ams")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn virtual_tray(&self) -> Option<&Value> {
        self.raw.get("vt_tray")
    }

    pub fn temperature(&self, key: &str) -> Option<f64> {
        self.temperatures.get(key).copied()
    }
}
