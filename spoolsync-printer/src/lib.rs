//! SpoolSync printer link - device-protocol client for Bambu-family printers
//!
//! Talks to one printer over its local MQTT broker:
//! - encrypted session with reconnection and spurious-disconnect filtering
//! - incremental aggregation of partial JSON reports into a `DeviceState`
//! - edge-triggered print start / completion and AMS change events
//! - calibration (pressure-advance) profile read / write / delete
//! - validated control commands

pub mod ams;
pub mod calibration;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod family;
pub mod health;
pub mod lifecycle;
pub mod message_log;
pub mod models;
pub mod mqtt;
pub mod router;
pub mod state;

pub use calibration::{ProfileDelete, ProfileWrite};
pub use client::PrinterClient;
pub use commands::PrinterCommand;
pub use config::PrinterConfig;
pub use error::{PrinterError, Result};
pub use events::{PrintJob, PrinterEvent};
pub use family::DeviceFamily;
pub use lifecycle::{PrintLifecycle, PrintOutcome};
pub use models::{CalibrationProfile, DeviceState, HealthAlert, NozzleDescriptor, PrintStatus};
pub use mqtt::{Publisher, TransportEvent};
