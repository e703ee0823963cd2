//! AMS (filament bay) change detection.

use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Payload that is neither a unit list nor an object wrapping one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnexpectedShape(pub &'static str);

impl fmt::Display for UnexpectedShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected AMS payload shape: {}", self.0)
    }
}

impl std::error::Error for UnexpectedShape {}

/// Accepts `[...]` or `{"ams": [...], ...}` and returns the unit list.
pub fn normalize(payload: &Value) -> Result<Vec<Value>, UnexpectedShape> {
    match payload {
        Value::Array(units) => Ok(units.clone()),
        Value::Object(map) => match map.get("ams") {
            Some(Value::Array(units)) => Ok(units.clone()),
            Some(_) => Err(UnexpectedShape("nested `ams` is not a list")),
            None => Err(UnexpectedShape("object without `ams` key")),
        },
        Value::Null => Err(UnexpectedShape("null")),
        Value::Bool(_) => Err(UnexpectedShape("bool")),
        Value::Number(_) => Err(UnexpectedShape("number")),
        Value::String(_) => Err(UnexpectedShape("string")),
    }
}

/// Canonical form of the filament-relevant tray fields.
///
/// Built from `(unit id, tray id, tray_type, tag_uid, remain)` per tray, in
/// payload order. Field order inside each JSON object does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AmsFingerprint(String);

impl AmsFingerprint {
    pub fn of(units: &[Value]) -> Self {
        let mut parts = Vec::new();
        for unit in units.iter().filter_map(Value::as_object) {
            let unit_id = field_text(unit.get("id"));
            let trays = unit.get("tray").and_then(Value::as_array);
            for tray in trays.into_iter().flatten().filter_map(Value::as_object) {
                parts.push(format!(
                    "{}:{}:{}:{}:{}",
                    unit_id,
                    field_text(tray.get("id")),
                    field_text(tray.get("tray_type")),
                    field_text(tray.get("tag_uid")),
                    field_text(tray.get("remain")),
                ));
            }
        }
        AmsFingerprint(parts.join("|"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn field_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Default)]
pub struct AmsChangeDetector {
    last: Option<AmsFingerprint>,
}

impl AmsChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the tray fingerprint differs from the last one seen.
    pub fn observe(&mut self, units: &[Value]) -> bool {
        let fingerprint = AmsFingerprint::of(units);
        if self.last.as_ref() == Some(&fingerprint) {
            return false;
        }
        debug!(fingerprint = fingerprint.as_str(), "AMS fingerprint changed");
        self.last = Some(fingerprint);
        true
    }
}
