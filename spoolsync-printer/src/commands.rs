//! Outbound control commands and their wire payloads.

use rumqttc::QoS;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{PrinterError, Result};

pub const MAX_TEMPERATURE: i32 = 350;
pub const MAX_MOVE_DISTANCE: f64 = 100.0;
pub const MOVE_SPEED_RANGE: (u32, u32) = (100, 10_000);
pub const DEFAULT_MOVE_SPEED: u32 = 3000;
pub const MAX_GCODE_LEN: usize = 500;

fn invalid(msg: impl Into<String>) -> PrinterError {
    PrinterError::InvalidArgument(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            _ => None,
        }
    }
}

impl FromStr for Axis {
    type Err = PrinterError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.trim().chars();
        match (chars.next().and_then(Axis::from_char), chars.next()) {
            (Some(axis), None) => Ok(axis),
            _ => Err(invalid(format!("unknown axis `{s}`, expected X, Y or Z"))),
        }
    }
}

/// Speed profile: 1 silent, 2 standard, 3 sport, 4 ludicrous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedMode(u8);

impl TryFrom<u8> for SpeedMode {
    type Error = PrinterError;

    fn try_from(mode: u8) -> Result<Self> {
        if (1..=4).contains(&mode) {
            Ok(SpeedMode(mode))
        } else {
            Err(invalid(format!("speed mode {mode} out of range 1-4")))
        }
    }
}

impl SpeedMode {
    pub fn value(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fan {
    PartCooling = 1,
    Auxiliary = 2,
    Chamber = 3,
}

impl TryFrom<u8> for Fan {
    type Error = PrinterError;

    fn try_from(index: u8) -> Result<Self> {
        match index {
            1 => Ok(Fan::PartCooling),
            2 => Ok(Fan::Auxiliary),
            3 => Ok(Fan::Chamber),
            other => Err(invalid(format!("fan {other} out of range 1-3"))),
        }
    }
}

/// Target of an AMS filament change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmsTarget {
    Tray(u8),
    External,
    Unload,
}

impl AmsTarget {
    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            0..=15 => Ok(AmsTarget::Tray(id as u8)),
            254 => Ok(AmsTarget::External),
            255 => Ok(AmsTarget::Unload),
            other => Err(invalid(format!("tray {other} invalid, expected 0-15, 254 or 255"))),
        }
    }

    pub fn wire_id(self) -> u16 {
        match self {
            AmsTarget::Tray(id) => id as u16,
            AmsTarget::External => 254,
            AmsTarget::Unload => 255,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmsAction {
    Resume,
    Reset,
    Pause,
}

impl FromStr for AmsAction {
    type Err = PrinterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "resume" => Ok(AmsAction::Resume),
            "reset" => Ok(AmsAction::Reset),
            "pause" => Ok(AmsAction::Pause),
            other => Err(invalid(format!("unknown AMS action `{other}`"))),
        }
    }
}

impl AmsAction {
    fn as_str(self) -> &'static str {
        match self {
            AmsAction::Resume => "resume",
            AmsAction::Reset => "reset",
            AmsAction::Pause => "pause",
        }
    }
}

/// A command ready to publish on the request topic.
///
/// Build through the validating constructors; a value of this type is
/// always within the ranges the device accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum PrinterCommand {
    PushAll,
    Pause,
    Resume,
    Stop,
    StartPrint { filename: String, plate_id: u32 },
    Gcode(String),
    BedTemperature(u16),
    NozzleTemperature { target: u16, nozzle: u8 },
    PrintSpeed(SpeedMode),
    SetFan { fan: Fan, speed: u8 },
    ChamberLight(bool),
    Home(Vec<Axis>),
    Move {
        axis: Axis,
        distance: f64,
        speed: u32,
    },
    Motors(bool),
    ChangeFilament(AmsTarget),
    AmsControl(AmsAction),
    Timelapse(bool),
    LiveView(bool),
}

fn temperature(target: i32) -> Result<u16> {
    if (0..=MAX_TEMPERATURE).contains(&target) {
        Ok(target as u16)
    } else {
        Err(invalid(format!("temperature {target} out of range 0-{MAX_TEMPERATURE}")))
    }
}

impl PrinterCommand {
    pub fn start_print(filename: impl Into<String>, plate_id: u32) -> Result<Self> {
        let filename = filename.into();
        if filename.trim().is_empty() {
            return Err(invalid("empty file name"));
        }
        Ok(PrinterCommand::StartPrint {
            filename,
            plate_id: plate_id.max(1),
        })
    }

    pub fn gcode(line: impl Into<String>) -> Result<Self> {
        let line = line.into();
        if line.is_empty() || line.len() > MAX_GCODE_LEN {
            return Err(invalid(format!("G-code must be 1-{MAX_GCODE_LEN} characters")));
        }
        Ok(PrinterCommand::Gcode(line))
    }

    pub fn bed_temperature(target: i32) -> Result<Self> {
        Ok(PrinterCommand::BedTemperature(temperature(target)?))
    }

    pub fn nozzle_temperature(target: i32, nozzle: u8) -> Result<Self> {
        if nozzle > 1 {
            return Err(invalid(format!("nozzle {nozzle} out of range 0-1")));
        }
        Ok(PrinterCommand::NozzleTemperature {
            target: temperature(target)?,
            nozzle,
        })
    }

    pub fn print_speed(mode: u8) -> Result<Self> {
        Ok(PrinterCommand::PrintSpeed(SpeedMode::try_from(mode)?))
    }

    /// Speed is clamped to 0-255; only the fan index is validated.
    pub fn fan(fan: u8, speed: i32) -> Result<Self> {
        let fan = Fan::try_from(fan)?;
        Ok(PrinterCommand::SetFan {
            fan,
            speed: speed.clamp(0, 255) as u8,
        })
    }

    pub fn home(axes: &str) -> Result<Self> {
        let parsed = axes
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| Axis::from_char(c).ok_or_else(|| invalid(format!("unknown axis `{c}`"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(PrinterCommand::Home(parsed))
    }

    pub fn move_axis(axis: &str, distance: f64, speed: Option<u32>) -> Result<Self> {
        let axis: Axis = axis.parse()?;
        if !distance.is_finite() || distance.abs() > MAX_MOVE_DISTANCE {
            return Err(invalid(format!("distance {distance} out of range ±{MAX_MOVE_DISTANCE}")));
        }
        let speed = speed.unwrap_or(DEFAULT_MOVE_SPEED);
        let (lo, hi) = MOVE_SPEED_RANGE;
        if !(lo..=hi).contains(&speed) {
            return Err(invalid(format!("speed {speed} out of range {lo}-{hi}")));
        }
        Ok(PrinterCommand::Move {
            axis,
            distance,
            speed,
        })
    }

    pub fn load_filament(tray: u16) -> Result<Self> {
        Ok(PrinterCommand::ChangeFilament(AmsTarget::from_id(tray)?))
    }

    pub fn unload_filament() -> Self {
        PrinterCommand::ChangeFilament(AmsTarget::Unload)
    }

    pub fn ams_control(action: &str) -> Result<Self> {
        Ok(PrinterCommand::AmsControl(action.parse()?))
    }

    /// G-code body for commands that travel as `gcode_line`.
    pub fn gcode_body(&self) -> Option<String> {
        match self {
            PrinterCommand::Gcode(line) => Some(line.clone()),
            PrinterCommand::BedTemperature(t) => Some(format!("M140 S{t}")),
            PrinterCommand::NozzleTemperature { target, nozzle: 0 } => {
                Some(format!("M104 S{target}"))
            }
            PrinterCommand::NozzleTemperature { target, nozzle } => {
                Some(format!("M104 T{nozzle} S{target}"))
            }
            PrinterCommand::SetFan { fan, speed } => Some(format!("M106 P{} S{speed}", *fan as u8)),
            PrinterCommand::Home(axes) => {
                let list: Vec<String> = axes.iter().map(|a| a.letter().to_string()).collect();
                if list.is_empty() {
                    Some("G28".to_string())
                } else {
                    Some(format!("G28 {}", list.join(" ")))
                }
            }
            PrinterCommand::Move { axis, distance, speed } => {
                Some(format!("G91\nG0 {}{distance:.2} F{speed}\nG90", axis.letter()))
            }
            PrinterCommand::Motors(true) => Some("M17".to_string()),
            PrinterCommand::Motors(false) => Some("M18".to_string()),
            _ => None,
        }
    }

    /// Messages to publish, in order. Toggles are followed by a status refresh.
    pub fn payloads(&self, sequence_id: u64) -> Vec<Value> {
        if let Some(body) = self.gcode_body() {
            return vec![gcode_line(&body, &sequence_id.to_string())];
        }

        match self {
            PrinterCommand::PushAll => vec![push_all()],
            PrinterCommand::Pause => vec![print_command("pause")],
            PrinterCommand::Resume => vec![print_command("resume")],
            PrinterCommand::Stop => vec![print_command("stop")],
            PrinterCommand::StartPrint { filename, plate_id } => vec![json!({
                "print": {
                    "sequence_id": 0,
                    "command": "project_file",
                    "param": format!("Metadata/plate_{plate_id}.gcode"),
                    "subtask_name": filename,
                    "url": format!("ftp://{filename}"),
                    "timelapse": false,
                    "bed_leveling": true,
                    "flow_cali": true,
                    "vibration_cali": true,
                    "layer_inspect": false,
                    "use_ams": true,
                }
            })],
            PrinterCommand::PrintSpeed(mode) => vec![json!({
                "print": {
                    "command": "print_speed",
                    "param": mode.value().to_string(),
                    "sequence_id": "0",
                }
            })],
            PrinterCommand::ChamberLight(on) => vec![json!({
                "system": {
                    "command": "ledctrl",
                    "led_node": "chamber_light",
                    "led_mode": if *on { "on" } else { "off" },
                    "led_on_time": 500,
                    "led_off_time": 500,
                    "loop_times": 0,
                    "interval_time": 0,
                    "sequence_id": "0",
                }
            })],
            PrinterCommand::ChangeFilament(target) => vec![json!({
                "print": {
                    "command": "ams_change_filament",
                    "target": target.wire_id(),
                    "sequence_id": "0",
                }
            })],
            PrinterCommand::AmsControl(action) => vec![json!({
                "print": {
                    "command": "ams_control",
                    "param": action.as_str(),
                    "sequence_id": "0",
                }
            })],
            PrinterCommand::Timelapse(on) => vec![
                gcode_line(&format!("M981 S{} P20000", u8::from(*on)), "0"),
                push_all(),
            ],
            PrinterCommand::LiveView(on) => vec![
                json!({
                    "xcam": {
                        "command": "ipcam_record_set",
                        "control": if *on { "enable" } else { "disable" },
                        "sequence_id": "0",
                    }
                }),
                push_all(),
            ],
            // covered by gcode_body
            _ => Vec::new(),
        }
    }

    pub fn qos(&self) -> QoS {
        match self {
            PrinterCommand::Pause | PrinterCommand::Resume => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrinterCommand::PushAll => "pushall",
            PrinterCommand::Pause => "pause",
            PrinterCommand::Resume => "resume",
            PrinterCommand::Stop => "stop",
            PrinterCommand::StartPrint { .. } => "start_print",
            PrinterCommand::Gcode(_) => "gcode",
            PrinterCommand::BedTemperature(_) => "bed_temperature",
            PrinterCommand::NozzleTemperature { .. } => "nozzle_temperature",
            PrinterCommand::PrintSpeed(_) => "print_speed",
            PrinterCommand::SetFan { .. } => "fan",
            PrinterCommand::ChamberLight(_) => "chamber_light",
            PrinterCommand::Home(_) => "home",
            PrinterCommand::Move { .. } => "move",
            PrinterCommand::Motors(_) => "motors",
            PrinterCommand::ChangeFilament(_) => "ams_change_filament",
            PrinterCommand::AmsControl(_) => "ams_control",
            PrinterCommand::Timelapse(_) => "timelapse",
            PrinterCommand::LiveView(_) => "live_view",
        }
    }
}

impl fmt::Display for PrinterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn push_all() -> Value {
    json!({ "pushing": { "command": "pushall", "sequence_id": "0" } })
}

fn print_command(command: &str) -> Value {
    json!({ "print": { "command": command, "sequence_id": "0" } })
}

fn gcode_line(body: &str, sequence_id: &str) -> Value {
    json!({
        "print": {
            "command": "gcode_line",
            "param": body,
            "sequence_id": sequence_id,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_speed_is_clamped() {
        assert_eq!(
            PrinterCommand::fan(1, 400).unwrap().gcode_body().as_deref(),
            Some("M106 P1 S255")
        );
        assert_eq!(
            PrinterCommand::fan(3, -20).unwrap().gcode_body().as_deref(),
            Some("M106 P3 S0")
        );
        assert!(PrinterCommand::fan(4, 100).is_err());
    }

    #[test]
    fn invalid_axis_and_speed_mode_are_rejected() {
        assert!(PrinterCommand::move_axis("E", 5.0, None).is_err());
        assert!(PrinterCommand::move_axis("XY", 5.0, None).is_err());
        assert!(PrinterCommand::print_speed(0).is_err());
        assert!(PrinterCommand::print_speed(5).is_err());
        assert!(PrinterCommand::home("XQ").is_err());
    }

    #[test]
    fn move_builds_relative_gcode() {
        let cmd = PrinterCommand::move_axis("z", -1.5, None).unwrap();
        assert_eq!(cmd.gcode_body().as_deref(), Some("G91\nG0 Z-1.50 F3000\nG90"));
        assert!(PrinterCommand::move_axis("X", 150.0, None).is_err());
        assert!(PrinterCommand::move_axis("X", 10.0, Some(50)).is_err());
    }

    #[test]
    fn temperature_commands() {
        let bed = PrinterCommand::bed_temperature(60).unwrap();
        let payload = &bed.payloads(7)[0];
        assert_eq!(payload["print"]["param"], "M140 S60");
        assert_eq!(payload["print"]["sequence_id"], "7");

        let right = PrinterCommand::nozzle_temperature(220, 1).unwrap();
        assert_eq!(right.gcode_body().as_deref(), Some("M104 T1 S220"));
        assert!(PrinterCommand::bed_temperature(400).is_err());
        assert!(PrinterCommand::nozzle_temperature(200, 2).is_err());
    }

    #[test]
    fn home_joins_axes_with_spaces() {
        let cmd = PrinterCommand::home("xyz").unwrap();
        assert_eq!(cmd.gcode_body().as_deref(), Some("G28 X Y Z"));
    }

    #[test]
    fn ams_targets() {
        let load = PrinterCommand::load_filament(254).unwrap().payloads(0);
        assert_eq!(load[0]["print"]["target"], 254);
        assert_eq!(PrinterCommand::unload_filament().payloads(0)[0]["print"]["target"], 255);
        assert!(PrinterCommand::load_filament(16).is_err());
        assert!(PrinterCommand::ams_control("eject").is_err());
    }

    #[test]
    fn toggles_follow_up_with_pushall() {
        let payloads = PrinterCommand::Timelapse(true).payloads(3);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["print"]["param"], "M981 S1 P20000");
        assert_eq!(payloads[1], push_all());

        let live = PrinterCommand::LiveView(false).payloads(3);
        assert_eq!(live[0]["xcam"]["control"], "disable");
        assert_eq!(live[1]["pushing"]["command"], "pushall");
    }

    #[test]
    fn light_and_pause_payloads() {
        let light = &PrinterCommand::ChamberLight(true).payloads(0)[0];
        assert_eq!(light["system"]["led_mode"], "on");
        assert_eq!(light["system"]["led_on_time"], 500);

        assert_eq!(PrinterCommand::Pause.qos(), QoS::AtLeastOnce);
        assert_eq!(PrinterCommand::Stop.qos(), QoS::AtMostOnce);
        assert_eq!(PrinterCommand::Stop.payloads(9)[0]["print"]["sequence_id"], "0");
    }

    #[test]
    fn gcode_length_is_bounded() {
        assert!(PrinterCommand::gcode("").is_err());
        assert!(PrinterCommand::gcode("G".repeat(501)).is_err());
        assert!(PrinterCommand::gcode("M400").is_ok());
    }
}
