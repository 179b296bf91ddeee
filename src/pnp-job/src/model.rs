// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Job model: boards, placements, and work units.

use pnp_core::geom::Location;
use serde::{Deserialize, Serialize};

/// Which face of a board a placement or board location refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Top,
    Bottom,
}

/// One location on a board that can receive a dispense.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    pub id: String,
    /// What sits at this location (footprint or pad label).
    #[serde(default)]
    pub feature: String,
    /// Board-local position.
    pub location: Location,
    pub side: Side,
    /// Whether this placement receives a dispense in this operation.
    #[serde(default)]
    pub dispense: bool,
}

/// A board design: a name and its placements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub name: String,
    #[serde(default)]
    pub placements: Vec<Placement>,
}

/// A board instance positioned on the machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardLocation {
    pub board: Board,
    /// Global pose of the board origin.
    pub location: Location,
    pub side: Side,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether to visually verify this board's pose before dispensing.
    #[serde(default)]
    pub check_fiducials: bool,
}

fn default_true() -> bool {
    true
}

/// A production job: the boards on the machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    pub board_locations: Vec<BoardLocation>,
}

/// Lifecycle of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnitStatus {
    Pending,
    Processing,
    Skipped,
    Complete,
}

/// One dispense to perform: indices into the job plus a status. Created
/// during pre-flight, mutated in place by the dispense phase, discarded at
/// reset.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub board_location: usize,
    pub placement: usize,
    pub status: WorkUnitStatus,
}

impl WorkUnit {
    pub fn new(board_location: usize, placement: usize) -> Self {
        Self {
            board_location,
            placement,
            status: WorkUnitStatus::Pending,
        }
    }
}

/// Compose a board pose with a board-local placement location into the
/// absolute machine location: bottom-side placements mirror in X, the local
/// offset rotates with the board, Z comes from the board pose, and the
/// rotations add.
pub fn board_placement_location(pose: Location, side: Side, placement: Location) -> Location {
    let placement = placement.convert_to(pose.unit);
    let x = match side {
        Side::Top => placement.x,
        Side::Bottom => -placement.x,
    };
    let (sin, cos) = pose.rotation.to_radians().sin_cos();
    Location::new(
        pose.unit,
        pose.x + x * cos - placement.y * sin,
        pose.y + x * sin + placement.y * cos,
        pose.z,
        pose.rotation + placement.rotation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnp_core::geom::LengthUnit;

    fn mm(x: f64, y: f64, z: f64, rotation: f64) -> Location {
        Location::new(LengthUnit::Millimeters, x, y, z, rotation)
    }

    #[test]
    fn test_placement_translates_with_board() {
        let abs = board_placement_location(mm(10.0, 20.0, -5.0, 0.0), Side::Top, mm(5.0, 1.0, 0.0, 0.0));
        assert_eq!(abs.x, 15.0);
        assert_eq!(abs.y, 21.0);
        // Z always comes from the board pose.
        assert_eq!(abs.z, -5.0);
    }

    #[test]
    fn test_placement_rotates_with_board() {
        let abs = board_placement_location(mm(10.0, 10.0, 0.0, 90.0), Side::Top, mm(5.0, 0.0, 0.0, 45.0));
        assert!((abs.x - 10.0).abs() < 1e-9);
        assert!((abs.y - 15.0).abs() < 1e-9);
        assert_eq!(abs.rotation, 135.0);
    }

    #[test]
    fn test_bottom_side_mirrors_x() {
        let abs = board_placement_location(mm(0.0, 0.0, 0.0, 0.0), Side::Bottom, mm(5.0, 2.0, 0.0, 0.0));
        assert_eq!(abs.x, -5.0);
        assert_eq!(abs.y, 2.0);
    }
}
