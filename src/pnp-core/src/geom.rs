// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Machine coordinate types.
//!
//! A [`Location`] carries the four machine coordinates plus the length unit
//! they are expressed in. A `NaN` component means "this axis is not part of
//! the move" and is preserved through conversion and arithmetic.

use serde::{Deserialize, Serialize};

/// Unit of length a [`Location`] is expressed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthUnit {
    #[default]
    Millimeters,
    Inches,
}

impl LengthUnit {
    /// Millimeters per one of this unit.
    fn mm_factor(self) -> f64 {
        match self {
            LengthUnit::Millimeters => 1.0,
            LengthUnit::Inches => 25.4,
        }
    }
}

/// A machine position: linear axes in `unit`, rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub unit: LengthUnit,
}

impl Default for Location {
    fn default() -> Self {
        Self::new(LengthUnit::Millimeters, 0.0, 0.0, 0.0, 0.0)
    }
}

impl Location {
    pub fn new(unit: LengthUnit, x: f64, y: f64, z: f64, rotation: f64) -> Self {
        Self {
            x,
            y,
            z,
            rotation,
            unit,
        }
    }

    /// All components masked out; combine with the `with_*` helpers to move
    /// a single axis.
    pub fn masked(unit: LengthUnit) -> Self {
        Self::new(unit, f64::NAN, f64::NAN, f64::NAN, f64::NAN)
    }

    pub fn with_x(mut self, x: f64) -> Self {
        self.x = x;
        self
    }

    pub fn with_y(mut self, y: f64) -> Self {
        self.y = y;
        self
    }

    pub fn with_z(mut self, z: f64) -> Self {
        self.z = z;
        self
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = rotation;
        self
    }

    /// Express this location in another unit. Rotation is unaffected; `NaN`
    /// components stay `NaN`.
    pub fn convert_to(self, unit: LengthUnit) -> Self {
        if unit == self.unit {
            return self;
        }
        let factor = self.unit.mm_factor() / unit.mm_factor();
        Self {
            x: self.x * factor,
            y: self.y * factor,
            z: self.z * factor,
            rotation: self.rotation,
            unit,
        }
    }

    pub fn add(self, other: Location) -> Self {
        let other = other.convert_to(self.unit);
        Self {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
            rotation: self.rotation + other.rotation,
            unit: self.unit,
        }
    }

    pub fn subtract(self, other: Location) -> Self {
        let other = other.convert_to(self.unit);
        Self {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
            rotation: self.rotation - other.rotation,
            unit: self.unit,
        }
    }

    /// Straight-line distance in the XY plane.
    pub fn linear_distance_to(self, other: Location) -> f64 {
        let other = other.convert_to(self.unit);
        (self.x - other.x).hypot(self.y - other.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversion() {
        let loc = Location::new(LengthUnit::Inches, 1.0, 2.0, -0.5, 90.0);
        let mm = loc.convert_to(LengthUnit::Millimeters);
        assert_eq!(mm.x, 25.4);
        assert_eq!(mm.y, 50.8);
        assert_eq!(mm.z, -12.7);
        // Rotation does not scale with the unit.
        assert_eq!(mm.rotation, 90.0);

        let back = mm.convert_to(LengthUnit::Inches);
        assert!((back.x - loc.x).abs() < 1e-12);
        assert!((back.z - loc.z).abs() < 1e-12);
    }

    #[test]
    fn test_subtract_converts_other() {
        let a = Location::new(LengthUnit::Millimeters, 50.8, 0.0, 0.0, 0.0);
        let b = Location::new(LengthUnit::Inches, 1.0, 0.0, 0.0, 0.0);
        let d = a.subtract(b);
        assert_eq!(d.x, 25.4);
        assert_eq!(d.unit, LengthUnit::Millimeters);
    }

    #[test]
    fn test_masked_components_survive_conversion() {
        let loc = Location::masked(LengthUnit::Millimeters).with_z(10.0);
        let inches = loc.convert_to(LengthUnit::Inches);
        assert!(inches.x.is_nan());
        assert!(inches.y.is_nan());
        assert!(inches.rotation.is_nan());
        assert!((inches.z - 10.0 / 25.4).abs() < 1e-12);
    }

    #[test]
    fn test_linear_distance_is_planar() {
        let a = Location::new(LengthUnit::Millimeters, 0.0, 0.0, 5.0, 0.0);
        let b = Location::new(LengthUnit::Millimeters, 3.0, 4.0, -20.0, 45.0);
        assert_eq!(a.linear_distance_to(b), 5.0);
    }
}
