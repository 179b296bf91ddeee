// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Vision collaborator contract.
//!
//! The locating algorithm itself lives elsewhere; the driver and the job
//! processor only depend on this call shape.

use std::future::Future;
use std::pin::Pin;

use crate::geom::Location;
use crate::DynResult;

/// Locates a known reference feature near a nominal pose and returns the
/// visually corrected pose.
pub trait FiducialLocator: Send {
    fn locate<'a>(
        &'a mut self,
        nominal: Location,
        feature: &'a str,
    ) -> Pin<Box<dyn Future<Output = DynResult<Location>> + Send + 'a>>;
}
