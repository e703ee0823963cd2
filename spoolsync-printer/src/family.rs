//! Hardware family, resolved once from the device serial number.

use serde::{Deserialize, Serialize};

/// Serial prefix of the dual-extruder models.
const DUAL_EXTRUDER_PREFIX: &str = "094";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    DualExtruder,
    SingleExtruder,
}

impl DeviceFamily {
    pub fn from_serial(serial: &str) -> Self {
        if serial.starts_with(DUAL_EXTRUDER_PREFIX) {
            DeviceFamily::DualExtruder
        } else {
            DeviceFamily::SingleExtruder
        }
    }

    pub fn is_dual(self) -> bool {
        matches!(self, DeviceFamily::DualExtruder)
    }

    pub fn nozzle_count(self) -> usize {
        if self.is_dual() {
            2
        } else {
            1
        }
    }
}
