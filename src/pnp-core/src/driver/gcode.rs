// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! G-code driver.
//!
//! Renders every operation from the configurable command table and runs it
//! through the command exchange. Nothing in here knows a specific firmware
//! dialect; the dialect lives entirely in the configured templates and
//! patterns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::axis::{AxisRegistry, AxisType};
use crate::command::{substitute_variable, CommandKind, CommandSet, TemplateValue};
use crate::driver::events::MachineEventEmitter;
use crate::driver::exchange::{CommandExchange, ResponseReader};
use crate::driver::{Device, DriverFuture, MachineDriver};
use crate::error::{ErrorKind, MachineError};
use crate::geom::{LengthUnit, Location};
use crate::transport::{TransportRead, TransportWrite};
use crate::vision::FiducialLocator;
use crate::DynResult;

/// Wait used when draining boot noise and when polling for a
/// move-complete match.
const DRAIN_WAIT: Duration = Duration::from_millis(250);

/// How long disconnect waits for the response reader to stop.
const READER_JOIN_WAIT: Duration = Duration::from_secs(2);

/// Global driver settings. Everything dialect-specific lives in the
/// command set instead.
#[derive(Debug, Clone)]
pub struct GcodeDriverConfig {
    pub units: LengthUnit,
    pub max_feed_rate: f64,
    /// Budget for one command exchange and for move-complete polling.
    pub response_timeout: Duration,
    /// Settle time after opening the transport before the first exchange.
    pub connect_settle: Duration,
    /// Reference feature used to visually reconcile the home switches, if
    /// the machine has one and a locator is attached.
    pub homing_fiducial: Option<String>,
}

impl Default for GcodeDriverConfig {
    fn default() -> Self {
        Self {
            units: LengthUnit::Millimeters,
            max_feed_rate: 1000.0,
            response_timeout: Duration::from_secs(5),
            connect_settle: Duration::from_secs(1),
            homing_fiducial: None,
        }
    }
}

/// One axis of a planned move.
struct AxisPlan {
    placeholder: &'static str,
    axis_name: String,
    raw: f64,
    changed: bool,
    pre_move: Option<String>,
}

/// Driver speaking a configurable line-oriented command protocol.
pub struct GcodeDriver {
    config: GcodeDriverConfig,
    commands: CommandSet,
    axes: Arc<Mutex<AxisRegistry>>,
    emitter: Arc<MachineEventEmitter>,
    exchange: Option<CommandExchange>,
    reader_task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
    connected: bool,
    /// Nozzles currently holding a pick; gates the pump commands.
    picked: HashSet<String>,
    locator: Option<Box<dyn FiducialLocator>>,
    sub_drivers: Vec<Box<dyn MachineDriver>>,
}

impl GcodeDriver {
    pub fn new(config: GcodeDriverConfig, commands: CommandSet, axes: AxisRegistry) -> Self {
        Self {
            config,
            commands,
            axes: Arc::new(Mutex::new(axes)),
            emitter: Arc::new(MachineEventEmitter::new()),
            exchange: None,
            reader_task: None,
            shutdown: None,
            connected: false,
            picked: HashSet::new(),
            locator: None,
            sub_drivers: Vec::new(),
        }
    }

    pub fn add_sub_driver(&mut self, driver: Box<dyn MachineDriver>) {
        self.sub_drivers.push(driver);
    }

    pub fn set_fiducial_locator(&mut self, locator: Box<dyn FiducialLocator>) {
        self.locator = Some(locator);
    }

    pub fn emitter(&self) -> Arc<MachineEventEmitter> {
        self.emitter.clone()
    }

    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    /// Template edits only affect patterns already compiled (confirmation,
    /// position report) from the next connect on.
    pub fn commands_mut(&mut self) -> &mut CommandSet {
        &mut self.commands
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Bring up the connection: start the response reader, let the
    /// controller settle, drain its boot noise, disable outputs, and send
    /// the connect template.
    pub async fn connect(
        &mut self,
        reader: Box<dyn TransportRead>,
        writer: Box<dyn TransportWrite>,
    ) -> DynResult<()> {
        if self.exchange.is_some() {
            return Err(MachineError::invalid_state("already connected").into());
        }

        let confirm_text = self
            .commands
            .text(None, CommandKind::ConfirmPattern)
            .unwrap_or_else(|| "^ok.*".to_string());
        let confirm = compile_pattern("confirmation", &confirm_text)?;
        let report = match self.commands.text(None, CommandKind::PositionReportPattern) {
            Some(text) => Some(compile_pattern("position report", &text)?),
            None => None,
        };

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.reader_task = Some(
            ResponseReader::new(
                reader,
                response_tx,
                report,
                self.axes.clone(),
                self.emitter.clone(),
                shutdown_rx,
            )
            .spawn(),
        );
        self.exchange = Some(CommandExchange::new(writer, response_rx, confirm));
        self.shutdown = Some(shutdown_tx);

        // Give the controller a moment to start up.
        time::sleep(self.config.connect_settle).await;

        // Consume any startup messages.
        loop {
            match self.send_command(None, Some(DRAIN_WAIT)).await {
                Ok(lines) if lines.is_empty() => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        let disable = self.commands.text(None, CommandKind::Disable);
        self.send_gcode(disable.as_deref(), Some(self.config.response_timeout))
            .await?;

        let connect = self.commands.text(None, CommandKind::Connect);
        self.send_gcode(connect.as_deref(), Some(self.config.response_timeout))
            .await?;

        self.connected = true;
        self.emitter.notify_connection_change(true);
        info!("controller connected");
        Ok(())
    }

    pub async fn set_enabled(&mut self, enabled: bool) -> DynResult<()> {
        if self.connected {
            let kind = if enabled {
                CommandKind::Enable
            } else {
                CommandKind::Disable
            };
            let text = self.commands.text(None, kind);
            self.send_gcode(text.as_deref(), Some(self.config.response_timeout))
                .await?;
        }
        for driver in &mut self.sub_drivers {
            driver.set_enabled(enabled).await?;
        }
        Ok(())
    }

    pub async fn home(&mut self, head: &Device) -> DynResult<()> {
        let command = self.commands.text(None, CommandKind::Home).map(|c| {
            let c = substitute_variable(&c, "Id", Some(head.id.as_str().into()));
            substitute_variable(&c, "Name", Some(head.name.as_str().into()))
        });
        // Homing duration is unknowable, so the wait is unbounded.
        self.send_gcode(command.as_deref(), None).await?;

        self.axes.lock().unwrap().home_all();

        for driver in &mut self.sub_drivers {
            driver.home(head).await?;
        }

        if let Some(feature) = self.config.homing_fiducial.clone() {
            if self.locator.is_some() {
                self.vision_home(head, &feature).await?;
            }
        }
        Ok(())
    }

    /// Reconcile the home switches against a visually verified reference:
    /// locate the feature near the nominal origin, re-declare X/Y as home,
    /// and tell the controller so via the position-set template.
    async fn vision_home(&mut self, head: &Device, feature: &str) -> DynResult<()> {
        let origin = Location::new(self.config.units, 0.0, 0.0, 0.0, 0.0);
        let locator = self
            .locator
            .as_mut()
            .ok_or_else(|| MachineError::invalid_state("no fiducial locator attached"))?;
        let corrected = locator.locate(origin, feature).await?;
        debug!("homing fiducial {feature} located at {corrected:?}");

        let (home_x, home_y) = {
            let mut axes = self.axes.lock().unwrap();
            axes.home_types(&[AxisType::X, AxisType::Y]);
            (
                axes.axis_for(&head.id, AxisType::X)
                    .map(|a| a.home_coordinate)
                    .unwrap_or(0.0),
                axes.axis_for(&head.id, AxisType::Y)
                    .map(|a| a.home_coordinate)
                    .unwrap_or(0.0),
            )
        };

        let command = self.commands.text(None, CommandKind::PositionSet).map(|c| {
            let c = substitute_variable(&c, "X", Some(home_x.into()));
            substitute_variable(&c, "Y", Some(home_y.into()))
        });
        self.send_gcode(command.as_deref(), None).await?;
        Ok(())
    }

    /// Current position of a device: transformed axis coordinates plus the
    /// device's fixed offsets.
    pub fn location(&self, device: &Device) -> Location {
        let axes = self.axes.lock().unwrap();
        let component = |axis_type| {
            axes.axis_for(&device.id, axis_type)
                .map(|a| a.transformed_coordinate(&device.id))
                .unwrap_or(0.0)
        };
        Location::new(
            self.config.units,
            component(AxisType::X),
            component(AxisType::Y),
            component(AxisType::Z),
            component(AxisType::Rotation),
        )
        .add(device.offsets)
    }

    pub async fn move_to(
        &mut self,
        device: &Device,
        location: Location,
        speed: f64,
    ) -> DynResult<()> {
        if !device.capabilities.movable {
            return Err(
                MachineError::invalid_state(format!("device {} is not movable", device.id)).into(),
            );
        }
        let target = location.convert_to(self.config.units).subtract(device.offsets);

        // Resolve each axis: NaN components and axes with no mapping are
        // excluded; targets equal to the current raw coordinate are carried
        // but marked unchanged so their placeholder renders empty.
        let plans: Vec<AxisPlan> = {
            let axes = self.axes.lock().unwrap();
            let components = [
                (AxisType::X, "X", target.x),
                (AxisType::Y, "Y", target.y),
                (AxisType::Z, "Z", target.z),
                (AxisType::Rotation, "Rotation", target.rotation),
            ];
            components
                .into_iter()
                .filter(|(_, _, value)| !value.is_nan())
                .filter_map(|(axis_type, placeholder, value)| {
                    axes.axis_for(&device.id, axis_type).map(|axis| {
                        let raw = match &axis.transform {
                            Some(t) => t.to_raw(&device.id, value),
                            None => value,
                        };
                        AxisPlan {
                            placeholder,
                            axis_name: axis.name.clone(),
                            raw,
                            changed: axis.coordinate != raw,
                            pre_move: axis.pre_move_command.clone(),
                        }
                    })
                })
                .collect()
        };

        // Nothing changes: no command at all.
        if !plans.iter().any(|p| p.changed) {
            return Ok(());
        }

        if let Some(template) = self.commands.text(Some(&device.id), CommandKind::MoveTo) {
            let mut command = substitute_variable(&template, "Id", Some(device.id.as_str().into()));
            command = substitute_variable(&command, "Name", Some(device.name.as_str().into()));
            command = substitute_variable(
                &command,
                "FeedRate",
                Some((self.config.max_feed_rate * speed).into()),
            );
            for placeholder in ["X", "Y", "Z", "Rotation"] {
                let value = plans
                    .iter()
                    .find(|p| p.placeholder == placeholder && p.changed)
                    .map(|p| TemplateValue::from(p.raw));
                command = substitute_variable(&command, placeholder, value);
            }

            for pre_move in plans
                .iter()
                .filter(|p| p.changed)
                .filter_map(|p| p.pre_move.clone())
            {
                self.send_gcode(Some(&pre_move), Some(self.config.response_timeout))
                    .await?;
            }

            let responses = self
                .send_gcode(Some(&command), Some(self.config.response_timeout))
                .await?;
            self.await_move_complete(device, &command, responses).await?;
        }

        {
            let mut axes = self.axes.lock().unwrap();
            for plan in &plans {
                if let Some(axis) = axes.axis_named_mut(&plan.axis_name) {
                    axis.coordinate = plan.raw;
                }
            }
        }

        for driver in &mut self.sub_drivers {
            driver.move_to(device, location, speed).await?;
        }
        Ok(())
    }

    /// If a move-complete pattern is configured, search the immediate
    /// responses and then poll further ones until it matches or the
    /// timeout budget is spent.
    async fn await_move_complete(
        &mut self,
        device: &Device,
        command: &str,
        responses: Vec<String>,
    ) -> DynResult<()> {
        let Some(pattern_text) = self
            .commands
            .text(Some(&device.id), CommandKind::MoveCompletePattern)
        else {
            return Ok(());
        };
        let pattern = compile_pattern("move complete", &pattern_text)?;
        if responses.iter().any(|r| pattern.is_match(r)) {
            return Ok(());
        }
        let deadline = time::Instant::now() + self.config.response_timeout;
        while time::Instant::now() < deadline {
            let extra = self.send_command(None, Some(DRAIN_WAIT)).await?;
            if extra.iter().any(|r| pattern.is_match(r)) {
                return Ok(());
            }
        }
        Err(MachineError::new(
            ErrorKind::Timeout,
            format!("timed out waiting for move to complete: {command:?}"),
        )
        .into())
    }

    pub async fn pick(&mut self, nozzle: &Device) -> DynResult<()> {
        if !nozzle.capabilities.pick_place {
            return Err(MachineError::invalid_state(format!(
                "device {} cannot pick",
                nozzle.id
            ))
            .into());
        }

        // The pump follows the first hold only; further picks share it.
        self.picked.insert(nozzle.id.clone());
        if self.picked.len() == 1 {
            let pump_on = self.commands.text(None, CommandKind::PumpOn);
            self.send_gcode(pump_on.as_deref(), Some(self.config.response_timeout))
                .await?;
        }

        let command = self
            .commands
            .text(Some(&nozzle.id), CommandKind::Pick)
            .map(|c| {
                let c = substitute_variable(&c, "Id", Some(nozzle.id.as_str().into()));
                substitute_variable(&c, "Name", Some(nozzle.name.as_str().into()))
            });
        self.send_gcode(command.as_deref(), Some(self.config.response_timeout))
            .await?;

        for driver in &mut self.sub_drivers {
            driver.pick(nozzle).await?;
        }
        Ok(())
    }

    pub async fn place(&mut self, nozzle: &Device) -> DynResult<()> {
        let command = self
            .commands
            .text(Some(&nozzle.id), CommandKind::Place)
            .map(|c| {
                let c = substitute_variable(&c, "Id", Some(nozzle.id.as_str().into()));
                substitute_variable(&c, "Name", Some(nozzle.name.as_str().into()))
            });
        self.send_gcode(command.as_deref(), Some(self.config.response_timeout))
            .await?;

        // Last release: shut the pump down before forgetting the hold so
        // the physical state never leads the bookkeeping.
        if self.picked.contains(&nozzle.id) && self.picked.len() == 1 {
            let pump_off = self.commands.text(None, CommandKind::PumpOff);
            self.send_gcode(pump_off.as_deref(), Some(self.config.response_timeout))
                .await?;
        }
        self.picked.remove(&nozzle.id);

        for driver in &mut self.sub_drivers {
            driver.place(nozzle).await?;
        }
        Ok(())
    }

    pub async fn actuate_switch(&mut self, actuator: &Device, on: bool) -> DynResult<()> {
        if !actuator.capabilities.actuate_switch {
            return Err(MachineError::invalid_state(format!(
                "device {} has no switch actuation",
                actuator.id
            ))
            .into());
        }
        let command = self
            .commands
            .text(Some(&actuator.id), CommandKind::ActuateSwitch)
            .map(|c| {
                let c = substitute_variable(&c, "Id", Some(actuator.id.as_str().into()));
                let c = substitute_variable(&c, "Name", Some(actuator.name.as_str().into()));
                let c = substitute_variable(&c, "Index", Some(actuator.index.into()));
                let c = substitute_variable(&c, "BooleanValue", Some(on.into()));
                // {True} and {False} render only on their own branch.
                let c = substitute_variable(&c, "True", on.then(|| TemplateValue::from(on)));
                substitute_variable(&c, "False", (!on).then(|| TemplateValue::from(on)))
            });
        self.send_gcode(command.as_deref(), Some(self.config.response_timeout))
            .await?;

        for driver in &mut self.sub_drivers {
            driver.actuate_switch(actuator, on).await?;
        }
        Ok(())
    }

    pub async fn actuate_value(&mut self, actuator: &Device, value: f64) -> DynResult<()> {
        if !actuator.capabilities.actuate_value {
            return Err(MachineError::invalid_state(format!(
                "device {} has no value actuation",
                actuator.id
            ))
            .into());
        }
        let command = self
            .commands
            .text(Some(&actuator.id), CommandKind::ActuateValue)
            .map(|c| {
                let c = substitute_variable(&c, "Id", Some(actuator.id.as_str().into()));
                let c = substitute_variable(&c, "Name", Some(actuator.name.as_str().into()));
                let c = substitute_variable(&c, "Index", Some(actuator.index.into()));
                let c = substitute_variable(&c, "DoubleValue", Some(value.into()));
                substitute_variable(&c, "IntegerValue", Some((value as i64).into()))
            });
        self.send_gcode(command.as_deref(), Some(self.config.response_timeout))
            .await?;

        for driver in &mut self.sub_drivers {
            driver.actuate_value(actuator, value).await?;
        }
        Ok(())
    }

    /// Tear the connection down. Safe to call repeatedly and while an
    /// exchange is in flight: the reader stops, the transport closes, and
    /// the exchange resolves with an error instead of hanging.
    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.reader_task.take() {
            if time::timeout(READER_JOIN_WAIT, task).await.is_err() {
                warn!("response reader did not stop in time");
            }
        }
        // Dropping the exchange drops the transport write half.
        self.exchange = None;
        if self.connected {
            self.connected = false;
            self.emitter.notify_connection_change(false);
            info!("controller disconnected");
        }
    }

    pub async fn close(&mut self) -> DynResult<()> {
        self.disconnect().await;
        for driver in &mut self.sub_drivers {
            driver.close().await?;
        }
        Ok(())
    }

    /// Send a multi-line template, one exchange per non-empty line. A
    /// missing template (`None`) is an intentional no-op so that partially
    /// configured dialects can simply omit operations.
    async fn send_gcode(
        &mut self,
        text: Option<&str>,
        timeout: Option<Duration>,
    ) -> DynResult<Vec<String>> {
        let Some(text) = text else {
            return Ok(Vec::new());
        };
        let mut responses = Vec::new();
        for line in text.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            responses.extend(self.send_command(Some(line), timeout).await?);
        }
        Ok(responses)
    }

    async fn send_command(
        &mut self,
        command: Option<&str>,
        timeout: Option<Duration>,
    ) -> DynResult<Vec<String>> {
        let Some(exchange) = self.exchange.as_mut() else {
            return Err(MachineError::invalid_state("not connected").into());
        };
        exchange.send(command, timeout).await
    }
}

fn compile_pattern(what: &str, text: &str) -> DynResult<Regex> {
    Regex::new(text)
        .map_err(|e| MachineError::config(format!("invalid {what} pattern {text:?}: {e}")).into())
}

impl MachineDriver for GcodeDriver {
    fn set_enabled<'a>(&'a mut self, enabled: bool) -> DriverFuture<'a> {
        Box::pin(async move { GcodeDriver::set_enabled(self, enabled).await })
    }

    fn home<'a>(&'a mut self, head: &'a Device) -> DriverFuture<'a> {
        Box::pin(async move { GcodeDriver::home(self, head).await })
    }

    fn move_to<'a>(
        &'a mut self,
        device: &'a Device,
        location: Location,
        speed: f64,
    ) -> DriverFuture<'a> {
        Box::pin(async move { GcodeDriver::move_to(self, device, location, speed).await })
    }

    fn pick<'a>(&'a mut self, nozzle: &'a Device) -> DriverFuture<'a> {
        Box::pin(async move { GcodeDriver::pick(self, nozzle).await })
    }

    fn place<'a>(&'a mut self, nozzle: &'a Device) -> DriverFuture<'a> {
        Box::pin(async move { GcodeDriver::place(self, nozzle).await })
    }

    fn actuate_switch<'a>(&'a mut self, actuator: &'a Device, on: bool) -> DriverFuture<'a> {
        Box::pin(async move { GcodeDriver::actuate_switch(self, actuator, on).await })
    }

    fn actuate_value<'a>(&'a mut self, actuator: &'a Device, value: f64) -> DriverFuture<'a> {
        Box::pin(async move { GcodeDriver::actuate_value(self, actuator, value).await })
    }

    fn close<'a>(&'a mut self) -> DriverFuture<'a> {
        Box::pin(async move { GcodeDriver::close(self).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{Axis, AxisTransform};
    use crate::command::Command;
    use crate::driver::DeviceKind;
    use crate::testutil::{self, Firmware};
    use crate::transport::split_stream;

    fn test_config() -> GcodeDriverConfig {
        GcodeDriverConfig {
            connect_settle: Duration::ZERO,
            response_timeout: Duration::from_millis(800),
            ..GcodeDriverConfig::default()
        }
    }

    fn base_commands(entries: &[(CommandKind, &str)]) -> CommandSet {
        let mut commands = vec![Command::new(None, CommandKind::ConfirmPattern, "^ok.*")];
        commands.extend(
            entries
                .iter()
                .map(|(kind, text)| Command::new(None, *kind, text)),
        );
        CommandSet::new(commands)
    }

    async fn connected(commands: CommandSet, axes: AxisRegistry) -> (GcodeDriver, Firmware) {
        let (near, far) = tokio::io::duplex(4096);
        let firmware = testutil::ok_firmware(far);
        let mut driver = GcodeDriver::new(test_config(), commands, axes);
        let (read, write) = split_stream(near);
        driver.connect(read, write).await.unwrap();
        (driver, firmware)
    }

    fn head() -> Device {
        Device::new("h1", "Head", DeviceKind::Head)
    }

    #[tokio::test]
    async fn test_unchanged_move_sends_nothing() {
        let commands = base_commands(&[(
            CommandKind::MoveTo,
            "G0 {X:X%.4f} {Y:Y%.4f} {Z:Z%.4f} {Rotation:E%.4f} {FeedRate:F%.0f}",
        )]);
        let (mut driver, firmware) = connected(commands, AxisRegistry::default_set()).await;

        let target = Location::new(LengthUnit::Millimeters, 0.0, 0.0, 0.0, 0.0);
        driver.move_to(&head(), target, 1.0).await.unwrap();
        assert!(firmware.received().is_empty());
    }

    #[tokio::test]
    async fn test_move_renders_only_changing_axes() {
        let commands = base_commands(&[(
            CommandKind::MoveTo,
            "G0 {X:X%.4f} {Y:Y%.4f} {Z:Z%.4f} {Rotation:E%.4f} {FeedRate:F%.0f}",
        )]);
        let (mut driver, firmware) = connected(commands, AxisRegistry::default_set()).await;

        let target = Location::masked(LengthUnit::Millimeters)
            .with_x(12.5)
            .with_y(0.0);
        driver.move_to(&head(), target, 0.5).await.unwrap();

        // Y is unchanged and Z/Rotation are masked, so only X and the feed
        // rate make it into the command.
        assert_eq!(firmware.received(), vec!["G0 X12.5000    F500".to_string()]);

        let location = driver.location(&head());
        assert_eq!(location.x, 12.5);
        assert_eq!(location.y, 0.0);
    }

    #[tokio::test]
    async fn test_device_offsets_are_subtracted() {
        let commands = base_commands(&[(CommandKind::MoveTo, "G0 {X:X%.4f}")]);
        let (mut driver, firmware) = connected(commands, AxisRegistry::default_set()).await;

        let camera = Device::new("cam", "Camera", DeviceKind::CameraMount).with_offsets(
            Location::new(LengthUnit::Millimeters, 2.0, 0.0, 0.0, 0.0),
        );
        let target = Location::masked(LengthUnit::Millimeters).with_x(10.0);
        driver.move_to(&camera, target, 1.0).await.unwrap();

        assert_eq!(firmware.received(), vec!["G0 X8.0000".to_string()]);
        // Reading the location back adds the offsets again.
        assert_eq!(driver.location(&camera).x, 10.0);
    }

    #[tokio::test]
    async fn test_transform_converts_to_raw_before_send() {
        let mut shared_z = Axis::new("z", AxisType::Z, 0.0);
        shared_z.transform = Some(AxisTransform::Negating {
            negated_device_id: "n2".to_string(),
        });
        let axes = AxisRegistry::new(vec![Axis::new("x", AxisType::X, 0.0), shared_z]);
        let commands = base_commands(&[(CommandKind::MoveTo, "G0 {Z:Z%.4f}")]);
        let (mut driver, firmware) = connected(commands, axes).await;

        let nozzle = Device::new("n2", "Nozzle 2", DeviceKind::Nozzle);
        let target = Location::masked(LengthUnit::Millimeters).with_z(5.0);
        driver.move_to(&nozzle, target, 1.0).await.unwrap();

        assert_eq!(firmware.received(), vec!["G0 Z-5.0000".to_string()]);
        // The caller-visible coordinate is the transformed one.
        assert_eq!(driver.location(&nozzle).z, 5.0);
    }

    #[tokio::test]
    async fn test_pre_move_command_precedes_the_move() {
        let mut rotation = Axis::new("rotation", AxisType::Rotation, 0.0);
        rotation.pre_move_command = Some("T1".to_string());
        let axes = AxisRegistry::new(vec![rotation]);
        let commands = base_commands(&[(CommandKind::MoveTo, "G0 {Rotation:E%.4f}")]);
        let (mut driver, firmware) = connected(commands, axes).await;

        let target = Location::masked(LengthUnit::Millimeters).with_rotation(90.0);
        driver.move_to(&head(), target, 1.0).await.unwrap();

        assert_eq!(
            firmware.received(),
            vec!["T1".to_string(), "G0 E90.0000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_move_complete_polls_until_matched() {
        let commands = {
            let mut c = base_commands(&[(CommandKind::MoveTo, "G0 {X:X%.4f}")]);
            c.set(None, CommandKind::MoveCompletePattern, "^<Idle.*");
            c
        };
        let (mut driver, mut firmware) = connected(commands, AxisRegistry::default_set()).await;

        firmware.inject("<Idle|MPos:10.000>");
        let target = Location::masked(LengthUnit::Millimeters).with_x(10.0);
        driver.move_to(&head(), target, 1.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_move_complete_timeout_is_an_error() {
        let commands = {
            let mut c = base_commands(&[(CommandKind::MoveTo, "G0 {X:X%.4f}")]);
            c.set(None, CommandKind::MoveCompletePattern, "^<Idle.*");
            c
        };
        let (mut driver, _firmware) = connected(commands, AxisRegistry::default_set()).await;

        let target = Location::masked(LengthUnit::Millimeters).with_x(10.0);
        let err = driver.move_to(&head(), target, 1.0).await.unwrap_err();
        let machine_err = err.downcast_ref::<MachineError>().unwrap();
        assert!(machine_err.is_timeout());
    }

    #[tokio::test]
    async fn test_pump_runs_once_across_two_nozzles() {
        let commands = base_commands(&[
            (CommandKind::Pick, "M4 {Id}"),
            (CommandKind::Place, "M5 {Id}"),
            (CommandKind::PumpOn, "M8"),
            (CommandKind::PumpOff, "M9"),
        ]);
        let (mut driver, firmware) = connected(commands, AxisRegistry::default_set()).await;

        let n1 = Device::new("n1", "Nozzle 1", DeviceKind::Nozzle);
        let n2 = Device::new("n2", "Nozzle 2", DeviceKind::Nozzle);

        driver.pick(&n1).await.unwrap();
        driver.pick(&n2).await.unwrap();
        driver.place(&n1).await.unwrap();
        driver.place(&n2).await.unwrap();

        assert_eq!(
            firmware.received(),
            vec![
                "M8".to_string(),
                "M4 n1".to_string(),
                "M4 n2".to_string(),
                "M5 n1".to_string(),
                "M5 n2".to_string(),
                "M9".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_actuate_switch_renders_matching_branch_only() {
        let commands = base_commands(&[(
            CommandKind::ActuateSwitch,
            "M106 P{Index} {True:S255}{False:S0}",
        )]);
        let (mut driver, firmware) = connected(commands, AxisRegistry::default_set()).await;

        let valve = Device::new("v1", "Valve", DeviceKind::Actuator).with_index(2);
        driver.actuate_switch(&valve, true).await.unwrap();
        driver.actuate_switch(&valve, false).await.unwrap();

        assert_eq!(
            firmware.received(),
            vec!["M106 P2 S255".to_string(), "M106 P2 S0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_actuate_value_integer_conversion() {
        let commands = base_commands(&[(
            CommandKind::ActuateValue,
            "M900 P{Index} S{IntegerValue:%d} V{DoubleValue}",
        )]);
        let (mut driver, firmware) = connected(commands, AxisRegistry::default_set()).await;

        let valve = Device::new("v1", "Valve", DeviceKind::Actuator);
        driver.actuate_value(&valve, 2.75).await.unwrap();

        assert_eq!(firmware.received(), vec!["M900 P0 S2 V2.75".to_string()]);
    }

    #[tokio::test]
    async fn test_unconfigured_operation_is_a_noop() {
        let commands = base_commands(&[]);
        let (mut driver, firmware) = connected(commands, AxisRegistry::default_set()).await;

        let nozzle = Device::new("n1", "Nozzle 1", DeviceKind::Nozzle);
        driver.pick(&nozzle).await.unwrap();
        assert!(firmware.received().is_empty());
    }

    #[tokio::test]
    async fn test_home_resets_axes_and_runs_template() {
        let mut x = Axis::new("x", AxisType::X, 5.0);
        x.coordinate = 42.0;
        let axes = AxisRegistry::new(vec![x]);
        let commands = base_commands(&[(CommandKind::Home, "G28 ; {Id}")]);
        let (mut driver, firmware) = connected(commands, axes).await;

        driver.home(&head()).await.unwrap();
        assert_eq!(firmware.received(), vec!["G28 ; h1".to_string()]);
        assert_eq!(driver.location(&head()).x, 5.0);
    }

    #[tokio::test]
    async fn test_vision_home_sends_position_set() {
        struct FixedLocator;
        impl FiducialLocator for FixedLocator {
            fn locate<'a>(
                &'a mut self,
                nominal: Location,
                _feature: &'a str,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = DynResult<Location>> + Send + 'a>,
            > {
                Box::pin(async move { Ok(nominal.with_x(0.12).with_y(-0.07)) })
            }
        }

        let commands = base_commands(&[
            (CommandKind::Home, "G28"),
            (CommandKind::PositionSet, "G92 {X:X%.4f} {Y:Y%.4f}"),
        ]);
        let (near, far) = tokio::io::duplex(4096);
        let firmware = testutil::ok_firmware(far);
        let mut config = test_config();
        config.homing_fiducial = Some("FIDUCIAL-HOME".to_string());
        let mut driver = GcodeDriver::new(config, commands, AxisRegistry::default_set());
        driver.set_fiducial_locator(Box::new(FixedLocator));
        let (read, write) = split_stream(near);
        driver.connect(read, write).await.unwrap();

        driver.home(&head()).await.unwrap();
        assert_eq!(
            firmware.received(),
            vec!["G28".to_string(), "G92 X0.0000 Y0.0000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_operations_fan_out_to_sub_drivers() {
        #[derive(Default)]
        struct CountingDriver {
            calls: Arc<Mutex<Vec<&'static str>>>,
        }

        impl MachineDriver for CountingDriver {
            fn set_enabled<'a>(&'a mut self, _enabled: bool) -> DriverFuture<'a> {
                self.calls.lock().unwrap().push("set_enabled");
                Box::pin(async { Ok(()) })
            }
            fn home<'a>(&'a mut self, _head: &'a Device) -> DriverFuture<'a> {
                self.calls.lock().unwrap().push("home");
                Box::pin(async { Ok(()) })
            }
            fn move_to<'a>(
                &'a mut self,
                _device: &'a Device,
                _location: Location,
                _speed: f64,
            ) -> DriverFuture<'a> {
                self.calls.lock().unwrap().push("move_to");
                Box::pin(async { Ok(()) })
            }
            fn pick<'a>(&'a mut self, _nozzle: &'a Device) -> DriverFuture<'a> {
                self.calls.lock().unwrap().push("pick");
                Box::pin(async { Ok(()) })
            }
            fn place<'a>(&'a mut self, _nozzle: &'a Device) -> DriverFuture<'a> {
                self.calls.lock().unwrap().push("place");
                Box::pin(async { Ok(()) })
            }
            fn actuate_switch<'a>(&'a mut self, _actuator: &'a Device, _on: bool) -> DriverFuture<'a> {
                self.calls.lock().unwrap().push("actuate_switch");
                Box::pin(async { Ok(()) })
            }
            fn actuate_value<'a>(&'a mut self, _actuator: &'a Device, _value: f64) -> DriverFuture<'a> {
                self.calls.lock().unwrap().push("actuate_value");
                Box::pin(async { Ok(()) })
            }
            fn close<'a>(&'a mut self) -> DriverFuture<'a> {
                self.calls.lock().unwrap().push("close");
                Box::pin(async { Ok(()) })
            }
        }

        let commands = base_commands(&[(CommandKind::MoveTo, "G0 {X:X%.4f}")]);
        let (mut driver, _firmware) = connected(commands, AxisRegistry::default_set()).await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        driver.add_sub_driver(Box::new(CountingDriver {
            calls: calls.clone(),
        }));

        let nozzle = Device::new("n1", "Nozzle 1", DeviceKind::Nozzle);
        driver.home(&head()).await.unwrap();
        driver
            .move_to(&head(), Location::masked(LengthUnit::Millimeters).with_x(3.0), 1.0)
            .await
            .unwrap();
        driver.pick(&nozzle).await.unwrap();
        driver.place(&nozzle).await.unwrap();
        // A no-op move stops before the fan-out.
        driver
            .move_to(&head(), Location::masked(LengthUnit::Millimeters).with_x(3.0), 1.0)
            .await
            .unwrap();
        driver.close().await.unwrap();

        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &["home", "move_to", "pick", "place", "close"]
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let commands = base_commands(&[]);
        let (mut driver, _firmware) = connected(commands, AxisRegistry::default_set()).await;

        assert!(driver.is_connected());
        driver.disconnect().await;
        assert!(!driver.is_connected());
        driver.disconnect().await;

        let nozzle = Device::new("n1", "Nozzle 1", DeviceKind::Nozzle);
        let err = driver.pick(&nozzle).await;
        // Unconfigured pick is still a no-op even when disconnected.
        assert!(err.is_ok());
    }
}
