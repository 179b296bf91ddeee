// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Driver components.
//!
//! This module contains the device model, the common driver operation
//! surface, the command exchange with its background response reader, and
//! the concrete G-code driver.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::geom::Location;
use crate::DynResult;

pub mod events;
pub mod exchange;
pub mod gcode;

pub use events::{ListenerId, MachineEventEmitter, MachineListener};
pub use exchange::{CommandExchange, ResponseReader};
pub use gcode::{GcodeDriver, GcodeDriverConfig};

/// Alias to reduce type complexity in MachineDriver.
pub type DriverFuture<'a> = Pin<Box<dyn Future<Output = DynResult<()>> + Send + 'a>>;

/// What a device is, mechanically. Used to derive sensible default
/// capabilities; dispatch itself is driven by id and capabilities alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Head,
    Nozzle,
    Dispenser,
    Actuator,
    CameraMount,
}

/// Operations a device supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCapabilities {
    pub movable: bool,
    pub pick_place: bool,
    pub actuate_switch: bool,
    pub actuate_value: bool,
}

impl DeviceCapabilities {
    /// The capability set a device of this kind normally has.
    pub fn defaults_for(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Head | DeviceKind::CameraMount => Self {
                movable: true,
                ..Self::default()
            },
            DeviceKind::Nozzle => Self {
                movable: true,
                pick_place: true,
                ..Self::default()
            },
            DeviceKind::Dispenser => Self {
                movable: true,
                actuate_switch: true,
                actuate_value: true,
                ..Self::default()
            },
            DeviceKind::Actuator => Self {
                actuate_switch: true,
                actuate_value: true,
                ..Self::default()
            },
        }
    }
}

/// A mountable end-effector: a stable identity plus the capability set it
/// supports. Command lookup and axis applicability are functions of the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    /// Output index for actuators that share one command template.
    #[serde(default)]
    pub index: u32,
    /// Fixed offset of this device from the head origin.
    #[serde(default)]
    pub offsets: Location,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            index: 0,
            offsets: Location::default(),
            capabilities: DeviceCapabilities::defaults_for(kind),
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn with_offsets(mut self, offsets: Location) -> Self {
        self.offsets = offsets;
        self
    }
}

/// Common operation surface for machine drivers. A driver may chain
/// sub-drivers; every operation fans out to them after the primary
/// controller has handled it.
pub trait MachineDriver: Send {
    fn set_enabled<'a>(&'a mut self, enabled: bool) -> DriverFuture<'a>;

    fn home<'a>(&'a mut self, head: &'a Device) -> DriverFuture<'a>;

    fn move_to<'a>(
        &'a mut self,
        device: &'a Device,
        location: Location,
        speed: f64,
    ) -> DriverFuture<'a>;

    fn pick<'a>(&'a mut self, nozzle: &'a Device) -> DriverFuture<'a>;

    fn place<'a>(&'a mut self, nozzle: &'a Device) -> DriverFuture<'a>;

    fn actuate_switch<'a>(&'a mut self, actuator: &'a Device, on: bool) -> DriverFuture<'a>;

    fn actuate_value<'a>(&'a mut self, actuator: &'a Device, value: f64) -> DriverFuture<'a>;

    fn close<'a>(&'a mut self) -> DriverFuture<'a>;
}
