// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! The dispense job processor.
//!
//! Sequences a job through pre-flight validation, an optional vision
//! correction pass, per-unit dispensing, and cleanup, driven one step at a
//! time by [`next`](DispenseJobProcessor::next). Abort and skip are
//! messages into the state machine and are honored at unit boundaries; a
//! motion command already dispatched to the controller is never interrupted
//! mid-flight.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time;
use tracing::{debug, info};

use pnp_core::driver::{Device, MachineDriver};
use pnp_core::error::MachineError;
use pnp_core::geom::{LengthUnit, Location};
use pnp_core::vision::FiducialLocator;
use pnp_core::DynResult;

use crate::fsm::{StateMachine, Transition, MAX_CASCADE};
use crate::model::{board_placement_location, Job, WorkUnit, WorkUnitStatus};

/// Job phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    PreFlight,
    FiducialCheck,
    Dispense,
    Cleanup,
    Stopped,
}

/// Messages the processor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Initialize,
    Next,
    Complete,
    Abort,
    Skip,
    Reset,
}

/// Phase actions referenced by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Initialize,
    PreFlight,
    FiducialCheck,
    DispenseNext,
    SkipUnit,
    Cleanup,
    Reset,
}

/// The transition table. Kept as a free function so its shape can be
/// inspected and tested on its own.
pub fn transition_table() -> StateMachine<State, Message, Action> {
    StateMachine::new(State::Uninitialized)
        .add(
            Transition::new(State::Uninitialized, Message::Initialize, State::PreFlight)
                .with_action(Action::Initialize),
        )
        .add(
            Transition::new(State::PreFlight, Message::Next, State::FiducialCheck)
                .with_action(Action::PreFlight)
                .with_auto(Message::Next),
        )
        .add(Transition::new(State::PreFlight, Message::Abort, State::Cleanup).with_auto(Message::Next))
        .add(
            Transition::new(State::FiducialCheck, Message::Next, State::Dispense)
                .with_action(Action::FiducialCheck),
        )
        .add(Transition::new(State::FiducialCheck, Message::Skip, State::Dispense))
        .add(
            Transition::new(State::FiducialCheck, Message::Abort, State::Cleanup)
                .with_auto(Message::Next),
        )
        .add(
            Transition::new(State::Dispense, Message::Next, State::Dispense)
                .with_action(Action::DispenseNext),
        )
        .add(
            Transition::new(State::Dispense, Message::Skip, State::Dispense)
                .with_action(Action::SkipUnit),
        )
        .add(
            Transition::new(State::Dispense, Message::Complete, State::Cleanup)
                .with_auto(Message::Next),
        )
        .add(Transition::new(State::Dispense, Message::Abort, State::Cleanup).with_auto(Message::Next))
        .add(
            Transition::new(State::Cleanup, Message::Next, State::Stopped)
                .with_action(Action::Cleanup),
        )
        .add(
            Transition::new(State::Stopped, Message::Reset, State::Uninitialized)
                .with_action(Action::Reset),
        )
}

/// Settings for the dispense operation itself.
#[derive(Debug, Clone)]
pub struct DispenseSettings {
    pub units: LengthUnit,
    /// Retracted Z used before and after horizontal travel.
    pub safe_z: f64,
    /// How long the dispenser stays on per unit.
    pub dispense_time: Duration,
    /// Speed factor passed to the driver (1.0 = full feed rate).
    pub speed: f64,
}

impl Default for DispenseSettings {
    fn default() -> Self {
        Self {
            units: LengthUnit::Millimeters,
            safe_z: 0.0,
            dispense_time: Duration::from_millis(250),
            speed: 1.0,
        }
    }
}

/// Drives a dispense job against a machine driver and a vision locator.
pub struct DispenseJobProcessor {
    fsm: StateMachine<State, Message, Action>,
    driver: Box<dyn MachineDriver>,
    locator: Box<dyn FiducialLocator>,
    head: Device,
    dispenser: Device,
    settings: DispenseSettings,
    job: Option<Job>,
    units: Vec<WorkUnit>,
    /// Visually corrected board poses, keyed by board location index.
    fiducial_overrides: HashMap<usize, Location>,
}

impl DispenseJobProcessor {
    pub fn new(
        driver: Box<dyn MachineDriver>,
        locator: Box<dyn FiducialLocator>,
        head: Device,
        dispenser: Device,
        settings: DispenseSettings,
    ) -> Self {
        Self {
            fsm: transition_table(),
            driver,
            locator,
            head,
            dispenser,
            settings,
            job: None,
            units: Vec::new(),
            fiducial_overrides: HashMap::new(),
        }
    }

    pub fn state(&self) -> State {
        self.fsm.state()
    }

    /// Give the driver back, e.g. to disable and close the machine after
    /// the last job.
    pub fn into_driver(self) -> Box<dyn MachineDriver> {
        self.driver
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    /// Whether skip is currently a valid request.
    pub fn can_skip(&self) -> bool {
        self.fsm.can_send(Message::Skip)
    }

    /// Load a job and run the pre-flight validation gate.
    pub async fn initialize(&mut self, job: Job) -> DynResult<()> {
        self.job = Some(job);
        self.send(Message::Initialize).await
    }

    /// Advance the job one step. Returns false once the job has finished
    /// (normally or via abort) and the processor is back at Uninitialized.
    pub async fn next(&mut self) -> DynResult<bool> {
        if self.fsm.state() == State::Uninitialized {
            return Ok(false);
        }
        if self.fsm.state() == State::Dispense && self.is_job_complete() {
            // Nothing left to dispense: short-circuit to cleanup.
            self.send(Message::Complete).await?;
        } else {
            self.send(Message::Next).await?;
        }
        self.finish_if_stopped().await
    }

    /// Stop the job at the next unit boundary and run cleanup.
    pub async fn abort(&mut self) -> DynResult<()> {
        self.send(Message::Abort).await?;
        self.finish_if_stopped().await?;
        Ok(())
    }

    /// Skip the fiducial check, or the next pending unit while dispensing.
    pub async fn skip(&mut self) -> DynResult<()> {
        self.send(Message::Skip).await
    }

    fn is_job_complete(&self) -> bool {
        !self
            .units
            .iter()
            .any(|u| u.status == WorkUnitStatus::Pending)
    }

    /// Reaching Stopped ends the job: auto-reset and report completion.
    async fn finish_if_stopped(&mut self) -> DynResult<bool> {
        if self.fsm.state() == State::Stopped {
            self.send(Message::Reset).await?;
            info!("job complete");
            return Ok(false);
        }
        Ok(true)
    }

    /// Deliver one message, running actions before committing transitions
    /// and chasing auto messages iteratively.
    async fn send(&mut self, message: Message) -> DynResult<()> {
        let mut message = message;
        for _ in 0..MAX_CASCADE {
            let step = self.fsm.lookup(message)?;
            if let Some(action) = step.action {
                self.run_action(action).await?;
            }
            self.fsm.apply(step.next);
            match step.auto {
                Some(auto) => message = auto,
                None => return Ok(()),
            }
        }
        Err(crate::fsm::FsmError::cascade_overflow().into())
    }

    async fn run_action(&mut self, action: Action) -> DynResult<()> {
        match action {
            Action::Initialize => self.do_initialize(),
            Action::PreFlight => self.do_pre_flight().await,
            Action::FiducialCheck => self.do_fiducial_check().await,
            Action::DispenseNext => self.do_dispense_next().await,
            Action::SkipUnit => self.do_skip_unit(),
            Action::Cleanup => self.do_cleanup().await,
            Action::Reset => self.do_reset(),
        }
    }

    /// Validate that there is a job before any phase runs.
    fn do_initialize(&mut self) -> DynResult<()> {
        if self.job.is_none() {
            return Err(MachineError::invalid_state("cannot initialize without a job").into());
        }
        Ok(())
    }

    /// Resolve the working context, build the work-unit list, order it for
    /// sane travel, and park the head at safe Z.
    async fn do_pre_flight(&mut self) -> DynResult<()> {
        info!("checking job for setup errors");
        let job = self
            .job
            .as_ref()
            .ok_or_else(|| MachineError::invalid_state("no job loaded"))?;
        if !self.dispenser.capabilities.actuate_switch {
            return Err(MachineError::invalid_state(format!(
                "dispenser {} cannot be actuated",
                self.dispenser.id
            ))
            .into());
        }

        self.fiducial_overrides.clear();
        let mut units = Vec::new();
        for (board_index, board_location) in job.board_locations.iter().enumerate() {
            if !board_location.enabled {
                continue;
            }
            for (placement_index, placement) in
                board_location.board.placements.iter().enumerate()
            {
                if !placement.dispense {
                    continue;
                }
                if placement.side != board_location.side {
                    continue;
                }
                units.push(WorkUnit::new(board_index, placement_index));
            }
        }

        // Order by distance from the origin so the head does not wander
        // erratically across the boards.
        let origin = Location::new(self.settings.units, 0.0, 0.0, 0.0, 0.0);
        let distance = |unit: &WorkUnit| {
            let board_location = &job.board_locations[unit.board_location];
            let placement = &board_location.board.placements[unit.placement];
            origin.linear_distance_to(board_placement_location(
                board_location.location,
                board_location.side,
                placement.location,
            ))
        };
        units.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
        self.units = units;
        debug!("pre-flight found {} units", self.units.len());

        info!("preparing machine");
        self.retract_head().await
    }

    /// Ask the vision locator for a corrected pose for every board flagged
    /// for verification.
    async fn do_fiducial_check(&mut self) -> DynResult<()> {
        info!("performing fiducial checks");
        let Some(job) = self.job.as_ref() else {
            return Err(MachineError::invalid_state("no job loaded").into());
        };
        for (board_index, board_location) in job.board_locations.iter().enumerate() {
            if !board_location.enabled || !board_location.check_fiducials {
                continue;
            }
            let corrected = self
                .locator
                .locate(board_location.location, &board_location.board.name)
                .await?;
            debug!(
                "fiducial check for board {}: {:?}",
                board_location.board.name, corrected
            );
            self.fiducial_overrides.insert(board_index, corrected);
        }
        Ok(())
    }

    /// Dispense the next pending unit, if any.
    async fn do_dispense_next(&mut self) -> DynResult<()> {
        let Some(index) = self
            .units
            .iter()
            .position(|u| u.status == WorkUnitStatus::Pending)
        else {
            return Ok(());
        };
        self.units[index].status = WorkUnitStatus::Processing;

        let target = {
            let job = self
                .job
                .as_ref()
                .ok_or_else(|| MachineError::invalid_state("no job loaded"))?;
            let unit = &self.units[index];
            let board_location = &job.board_locations[unit.board_location];
            let placement = &board_location.board.placements[unit.placement];
            // A verified pose replaces the nominal one for this unit only.
            let pose = self
                .fiducial_overrides
                .get(&unit.board_location)
                .copied()
                .unwrap_or(board_location.location);
            board_placement_location(pose, board_location.side, placement.location)
        };

        self.move_dispenser_at_safe_z(target).await?;
        self.driver.actuate_switch(&self.dispenser, true).await?;
        time::sleep(self.settings.dispense_time).await;
        self.driver.actuate_switch(&self.dispenser, false).await?;
        self.retract_dispenser().await?;

        self.units[index].status = WorkUnitStatus::Complete;
        debug!("dispensed {target:?}");
        Ok(())
    }

    /// Mark the next pending unit skipped without touching the machine.
    fn do_skip_unit(&mut self) -> DynResult<()> {
        if let Some(unit) = self
            .units
            .iter_mut()
            .find(|u| u.status == WorkUnitStatus::Pending)
        {
            debug!(
                "skipping unit at board {} placement {}",
                unit.board_location, unit.placement
            );
            unit.status = WorkUnitStatus::Skipped;
        }
        Ok(())
    }

    async fn do_cleanup(&mut self) -> DynResult<()> {
        info!("cleaning up");
        self.retract_head().await
    }

    /// Discard the job reference and all work units.
    fn do_reset(&mut self) -> DynResult<()> {
        self.job = None;
        self.units.clear();
        self.fiducial_overrides.clear();
        Ok(())
    }

    /// Retract, travel above the target, then plunge.
    async fn move_dispenser_at_safe_z(&mut self, target: Location) -> DynResult<()> {
        let safe = Location::masked(target.unit).with_z(self.settings.safe_z);
        self.driver
            .move_to(&self.dispenser, safe, self.settings.speed)
            .await?;
        let above = target.with_z(f64::NAN);
        self.driver
            .move_to(&self.dispenser, above, self.settings.speed)
            .await?;
        self.driver
            .move_to(&self.dispenser, target, self.settings.speed)
            .await
    }

    async fn retract_head(&mut self) -> DynResult<()> {
        let safe = Location::masked(self.settings.units).with_z(self.settings.safe_z);
        self.driver
            .move_to(&self.head, safe, self.settings.speed)
            .await
    }

    async fn retract_dispenser(&mut self) -> DynResult<()> {
        let safe = Location::masked(self.settings.units).with_z(self.settings.safe_z);
        self.driver
            .move_to(&self.dispenser, safe, self.settings.speed)
            .await
    }
}
