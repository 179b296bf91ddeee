// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Machine profile and job file support for pnpd.
//!
//! A machine profile is a TOML file holding everything dialect- and
//! machine-specific: the serial port, global driver settings, axes,
//! devices, and the command templates. Jobs are JSON files. Patterns are
//! compiled during validation so a broken profile fails at startup rather
//! than mid-job.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use pnp_core::axis::{Axis, AxisRegistry};
use pnp_core::command::{Command, CommandKind, CommandSet};
use pnp_core::driver::{Device, DeviceCapabilities, DeviceKind, GcodeDriver, GcodeDriverConfig};
use pnp_core::geom::LengthUnit;
use pnp_core::DynResult;
use pnp_job::dispense::DispenseSettings;
use pnp_job::model::Job;

/// Top-level machine profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub general: GeneralSection,
    pub serial: SerialSection,
    pub driver: DriverSection,
    pub dispense: DispenseSection,
    #[serde(rename = "axis")]
    pub axes: Vec<Axis>,
    #[serde(rename = "device")]
    pub devices: Vec<Device>,
    #[serde(rename = "command")]
    pub commands: Vec<CommandEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    pub port: Option<String>,
    pub baud: u32,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub units: LengthUnit,
    pub max_feed_rate: f64,
    pub response_timeout_ms: u64,
    pub connect_settle_ms: u64,
    pub homing_fiducial: Option<String>,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            units: LengthUnit::Millimeters,
            max_feed_rate: 1000.0,
            response_timeout_ms: 5000,
            connect_settle_ms: 1000,
            homing_fiducial: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispenseSection {
    /// Device ids; default to the first device of the matching kind.
    pub head: Option<String>,
    pub dispenser: Option<String>,
    pub safe_z: f64,
    pub dispense_time_ms: u64,
    pub speed: f64,
}

impl Default for DispenseSection {
    fn default() -> Self {
        Self {
            head: None,
            dispenser: None,
            safe_z: 0.0,
            dispense_time_ms: 250,
            speed: 1.0,
        }
    }
}

/// One command-table entry as written in the profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEntry {
    /// Device id; omitted or `*` is the wildcard slot.
    #[serde(default)]
    pub device: Option<String>,
    pub kind: CommandKind,
    pub text: String,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))
    }

    /// Reject broken profiles before anything touches the machine:
    /// duplicate template slots, patterns that do not compile, and
    /// unresolvable head/dispenser references.
    pub fn validate(&self) -> DynResult<()> {
        let mut slots = HashSet::new();
        for entry in &self.commands {
            let device = entry.device.clone().filter(|d| d != "*");
            if !slots.insert((entry.kind, device.clone())) {
                return Err(format!(
                    "duplicate command entry for kind {:?}, device {:?}",
                    entry.kind, device
                )
                .into());
            }
            if matches!(
                entry.kind,
                CommandKind::ConfirmPattern
                    | CommandKind::PositionReportPattern
                    | CommandKind::MoveCompletePattern
            ) {
                Regex::new(&entry.text)
                    .map_err(|e| format!("invalid pattern for {:?}: {e}", entry.kind))?;
            }
        }
        self.head_device()?;
        self.dispenser_device()?;
        Ok(())
    }

    pub fn command_set(&self) -> CommandSet {
        let commands = self
            .commands
            .iter()
            .map(|entry| Command::new(entry.device.clone(), entry.kind, &entry.text))
            .collect();
        CommandSet::new(commands)
    }

    pub fn axis_registry(&self) -> AxisRegistry {
        if self.axes.is_empty() {
            AxisRegistry::default_set()
        } else {
            AxisRegistry::new(self.axes.clone())
        }
    }

    pub fn driver_config(&self) -> GcodeDriverConfig {
        GcodeDriverConfig {
            units: self.driver.units,
            max_feed_rate: self.driver.max_feed_rate,
            response_timeout: Duration::from_millis(self.driver.response_timeout_ms),
            connect_settle: Duration::from_millis(self.driver.connect_settle_ms),
            homing_fiducial: self.driver.homing_fiducial.clone(),
        }
    }

    pub fn build_driver(&self) -> DynResult<GcodeDriver> {
        self.validate()?;
        Ok(GcodeDriver::new(
            self.driver_config(),
            self.command_set(),
            self.axis_registry(),
        ))
    }

    pub fn dispense_settings(&self) -> DispenseSettings {
        DispenseSettings {
            units: self.driver.units,
            safe_z: self.dispense.safe_z,
            dispense_time: Duration::from_millis(self.dispense.dispense_time_ms),
            speed: self.dispense.speed,
        }
    }

    pub fn head_device(&self) -> DynResult<Device> {
        self.resolve_device(self.dispense.head.as_deref(), DeviceKind::Head, "head")
    }

    pub fn dispenser_device(&self) -> DynResult<Device> {
        self.resolve_device(
            self.dispense.dispenser.as_deref(),
            DeviceKind::Dispenser,
            "dispenser",
        )
    }

    fn resolve_device(&self, id: Option<&str>, kind: DeviceKind, role: &str) -> DynResult<Device> {
        let found = match id {
            Some(id) => self.devices.iter().find(|d| d.id == id),
            None => self.devices.iter().find(|d| d.kind == kind),
        };
        let mut device = found
            .cloned()
            .ok_or_else(|| format!("no {role} device in profile"))?;
        // A profile that lists a device without capabilities means the
        // defaults for its kind, not "can do nothing".
        if device.capabilities == DeviceCapabilities::default() {
            device.capabilities = DeviceCapabilities::defaults_for(device.kind);
        }
        Ok(device)
    }

    /// A complete worked example, kept parseable by a test.
    pub fn example_toml() -> String {
        r#"
[general]
log_level = "debug"

[serial]
port = "/dev/ttyUSB0"
baud = 115200

[driver]
units = "millimeters"
max_feed_rate = 15000.0
response_timeout_ms = 5000
connect_settle_ms = 1000
homing_fiducial = "FIDUCIAL-HOME"

[dispense]
head = "h1"
dispenser = "d1"
safe_z = 0.0
dispense_time_ms = 250
speed = 1.0

[[axis]]
name = "x"
type = "X"
home_coordinate = 0.0

[[axis]]
name = "y"
type = "Y"
home_coordinate = 0.0

[[axis]]
name = "z"
type = "Z"
home_coordinate = 0.0

[[axis]]
name = "rotation"
type = "Rotation"
home_coordinate = 0.0

[[device]]
id = "h1"
name = "Head"
kind = "head"

[[device]]
id = "d1"
name = "Glue Dispenser"
kind = "dispenser"

[[command]]
kind = "confirm_pattern"
text = "^ok.*"

[[command]]
kind = "position_report_pattern"
text = "^<Idle\\|MPos:(?P<x>[-\\d.]+),(?P<y>[-\\d.]+),(?P<z>[-\\d.]+)>$"

[[command]]
kind = "connect"
text = "G21\nG90"

[[command]]
kind = "home"
text = "$H"

[[command]]
kind = "move_to"
text = "G0 {X:X%.4f} {Y:Y%.4f} {Z:Z%.4f} {Rotation:A%.4f} {FeedRate:F%.0f}"

[[command]]
device = "d1"
kind = "actuate_switch"
text = "M106 P{Index} {True:S255}{False:S0}"
"#
        .to_string()
    }
}

/// Load a job description from a JSON file.
pub fn load_job(path: &Path) -> Result<Job, ConfigError> {
    let text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(path.to_path_buf(), e))?;
    serde_json::from_str(&text).map_err(|e| ConfigError::JobParseError(path.to_path_buf(), e))
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, toml::de::Error),
    JobParseError(PathBuf, serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadError(path, err) => {
                write!(f, "failed to read '{}': {}", path.display(), err)
            }
            Self::ParseError(path, err) => {
                write!(f, "failed to parse profile '{}': {}", path.display(), err)
            }
            Self::JobParseError(path, err) => {
                write!(f, "failed to parse job '{}': {}", path.display(), err)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
