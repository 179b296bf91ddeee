// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod dispense;
pub mod fsm;
pub mod model;

pub use dispense::{DispenseJobProcessor, DispenseSettings};
pub use fsm::{FsmError, StateMachine, Transition};
pub use model::{
    board_placement_location, Board, BoardLocation, Job, Placement, Side, WorkUnit, WorkUnitStatus,
};
