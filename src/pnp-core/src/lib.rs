// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod axis;
pub mod command;
pub mod driver;
pub mod error;
pub mod geom;
pub mod transport;
pub mod vision;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use axis::{Axis, AxisRegistry, AxisTransform, AxisType};
pub use command::{CommandKind, CommandSet, TemplateValue};
pub use driver::{Device, DeviceCapabilities, DeviceKind, GcodeDriver, MachineDriver};
pub use error::MachineError;
pub use geom::{LengthUnit, Location};
pub use vision::FiducialLocator;

#[cfg(test)]
pub(crate) mod testutil;
