// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Logical machine axes and their live coordinates.
//!
//! Axes map controller coordinates to the devices they apply to. A device
//! matches an axis when the axis lists its id or carries the `*` wildcard.
//! Coordinates are mutated only after a confirmed move, a parsed position
//! report, or homing.

use serde::{Deserialize, Serialize};

/// The four controllable degrees of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisType {
    X,
    Y,
    Z,
    Rotation,
}

impl AxisType {
    pub const ALL: [AxisType; 4] = [AxisType::X, AxisType::Y, AxisType::Z, AxisType::Rotation];
}

/// Bidirectional mapping between the coordinate a caller sees and the raw
/// coordinate the controller sees, parameterized by the requesting device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AxisTransform {
    /// Two physically linked axes driven by one motor where one side moves
    /// opposite to the other: the named device gets the negated value.
    Negating { negated_device_id: String },
}

impl AxisTransform {
    /// Raw controller coordinate for a caller-visible coordinate.
    pub fn to_raw(&self, device_id: &str, transformed: f64) -> f64 {
        match self {
            AxisTransform::Negating { negated_device_id } => {
                if device_id == negated_device_id {
                    -transformed
                } else {
                    transformed
                }
            }
        }
    }

    /// Caller-visible coordinate for a raw controller coordinate.
    pub fn to_transformed(&self, device_id: &str, raw: f64) -> f64 {
        match self {
            // Negation is its own inverse.
            AxisTransform::Negating { negated_device_id } => {
                if device_id == negated_device_id {
                    -raw
                } else {
                    raw
                }
            }
        }
    }
}

/// One logical axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    #[serde(rename = "type")]
    pub axis_type: AxisType,
    #[serde(default)]
    pub home_coordinate: f64,
    /// Device ids this axis applies to; `*` matches every device.
    #[serde(default = "wildcard_ids")]
    pub device_ids: Vec<String>,
    #[serde(default)]
    pub transform: Option<AxisTransform>,
    /// Command sent before any move that changes this axis.
    #[serde(default)]
    pub pre_move_command: Option<String>,
    /// Live controller coordinate. Not part of the persisted configuration.
    #[serde(skip)]
    pub coordinate: f64,
}

fn wildcard_ids() -> Vec<String> {
    vec!["*".to_string()]
}

impl Axis {
    pub fn new(name: impl Into<String>, axis_type: AxisType, home_coordinate: f64) -> Self {
        Self {
            name: name.into(),
            axis_type,
            home_coordinate,
            device_ids: wildcard_ids(),
            transform: None,
            pre_move_command: None,
            coordinate: 0.0,
        }
    }

    fn applies_to(&self, device_id: &str) -> bool {
        self.device_ids.iter().any(|id| id == "*" || id == device_id)
    }

    /// Coordinate as seen by `device_id`, transform applied.
    pub fn transformed_coordinate(&self, device_id: &str) -> f64 {
        match &self.transform {
            Some(t) => t.to_transformed(device_id, self.coordinate),
            None => self.coordinate,
        }
    }
}

/// Owner of all axes and their live coordinates.
#[derive(Debug, Default)]
pub struct AxisRegistry {
    axes: Vec<Axis>,
}

impl AxisRegistry {
    pub fn new(axes: Vec<Axis>) -> Self {
        Self { axes }
    }

    /// Default X/Y/Z/Rotation set, homed at zero, applying to every device.
    pub fn default_set() -> Self {
        Self::new(vec![
            Axis::new("x", AxisType::X, 0.0),
            Axis::new("y", AxisType::Y, 0.0),
            Axis::new("z", AxisType::Z, 0.0),
            Axis::new("rotation", AxisType::Rotation, 0.0),
        ])
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn axes_mut(&mut self) -> &mut [Axis] {
        &mut self.axes
    }

    /// First axis of the given type applicable to the device, if any.
    pub fn axis_for(&self, device_id: &str, axis_type: AxisType) -> Option<&Axis> {
        self.axes
            .iter()
            .find(|a| a.axis_type == axis_type && a.applies_to(device_id))
    }

    pub fn axis_for_mut(&mut self, device_id: &str, axis_type: AxisType) -> Option<&mut Axis> {
        self.axes
            .iter_mut()
            .find(|a| a.axis_type == axis_type && a.applies_to(device_id))
    }

    pub fn axis_named_mut(&mut self, name: &str) -> Option<&mut Axis> {
        self.axes.iter_mut().find(|a| a.name == name)
    }

    /// Reset every axis to its home coordinate.
    pub fn home_all(&mut self) {
        for axis in &mut self.axes {
            axis.coordinate = axis.home_coordinate;
        }
    }

    /// Reset only the named types to home, returning nothing. Used by the
    /// vision-corrected homing sequence for X/Y.
    pub fn home_types(&mut self, types: &[AxisType]) {
        for axis in &mut self.axes {
            if types.contains(&axis.axis_type) {
                axis.coordinate = axis.home_coordinate;
            }
        }
    }
}
