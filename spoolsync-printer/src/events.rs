use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::lifecycle::PrintOutcome;
use crate::models::DeviceState;

/// Job identification attached to lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintJob {
    pub filename: String,
    pub subtask_name: Option<String>,
    /// `print` section of the report that triggered the edge.
    pub raw: Value,
}

/// Notifications broadcast to observers of one printer.
///
/// Within a single report they are sent in this order: AMS change,
/// lifecycle edge, state change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrinterEvent {
    AmsChanged { units: Vec<Value> },
    PrintStarted { job: PrintJob },
    PrintCompleted {
        outcome: PrintOutcome,
        job: PrintJob,
    },
    StateChanged { state: Arc<DeviceState> },
}

impl PrinterEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PrinterEvent::AmsChanged { .. } => "ams_changed",
            PrinterEvent::PrintStarted { .. } => "print_started",
            PrinterEvent::PrintCompleted { .. } => "print_completed",
            PrinterEvent::StateChanged { .. } => "state_changed",
        }
    }
}
