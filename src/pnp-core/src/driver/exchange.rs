// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Command exchange and the background response reader.
//!
//! The reader is the only task that touches the transport read half. It
//! classifies every inbound line: position reports update the axis registry
//! directly, everything else is queued for [`CommandExchange`] to consume.
//! The exchange writes a command and then collects queued responses until
//! one matches the confirmation pattern or the time budget runs out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, trace, warn};

use crate::axis::AxisRegistry;
use crate::driver::events::MachineEventEmitter;
use crate::error::MachineError;
use crate::transport::{TransportRead, TransportWrite};
use crate::DynResult;

/// How long one reader poll waits before checking the shutdown flag again.
const READ_POLL: Duration = Duration::from_millis(250);

/// Background loop over the transport read half.
pub struct ResponseReader {
    transport: Box<dyn TransportRead>,
    responses: mpsc::UnboundedSender<String>,
    report_pattern: Option<Regex>,
    axes: Arc<Mutex<AxisRegistry>>,
    emitter: Arc<MachineEventEmitter>,
    shutdown: watch::Receiver<bool>,
}

impl ResponseReader {
    pub fn new(
        transport: Box<dyn TransportRead>,
        responses: mpsc::UnboundedSender<String>,
        report_pattern: Option<Regex>,
        axes: Arc<Mutex<AxisRegistry>>,
        emitter: Arc<MachineEventEmitter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            responses,
            report_pattern,
            axes,
            emitter,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.changed() => break,
                read = self.transport.read_line(READ_POLL) => match read {
                    // The wait lapsed; go around and check for shutdown.
                    Ok(None) => continue,
                    Ok(Some(line)) => {
                        let line = line.trim();
                        trace!("<< {line}");
                        if !self.process_position_report(line) {
                            let _ = self.responses.send(line.to_string());
                        }
                    }
                    // A dead transport surfaces to callers as exchange
                    // timeouts; the loop itself just ends.
                    Err(e) => {
                        error!("read error: {e}");
                        break;
                    }
                },
            }
        }
        debug!("response reader stopped");
    }

    /// Apply a position report line, if it is one. Returns false for
    /// ordinary command responses.
    fn process_position_report(&self, line: &str) -> bool {
        let Some(pattern) = &self.report_pattern else {
            return false;
        };
        let Some(caps) = pattern.captures(line) else {
            return false;
        };
        trace!("position report: {line}");
        {
            let mut axes = self.axes.lock().unwrap();
            for axis in axes.axes_mut() {
                let Some(group) = caps.name(&axis.name) else {
                    continue;
                };
                match group.as_str().parse::<f64>() {
                    Ok(value) => axis.coordinate = value,
                    Err(e) => {
                        warn!("bad position report value for axis {}: {e}", axis.name);
                    }
                }
            }
        }
        self.emitter.notify_activity();
        true
    }
}

/// Synchronous send/await primitive over the response queue.
pub struct CommandExchange {
    writer: Box<dyn TransportWrite>,
    responses: mpsc::UnboundedReceiver<String>,
    confirm: Regex,
}

impl CommandExchange {
    pub fn new(
        writer: Box<dyn TransportWrite>,
        responses: mpsc::UnboundedReceiver<String>,
        confirm: Regex,
    ) -> Self {
        Self {
            writer,
            responses,
            confirm,
        }
    }

    /// Send one command line and collect responses until one matches the
    /// confirmation pattern or the budget runs out.
    ///
    /// `command: None` flushes without writing anything, which is how boot
    /// noise gets drained. `timeout: None` waits unboundedly; a sent
    /// command that is never confirmed within a bounded budget is a
    /// timeout error naming the command.
    pub async fn send(
        &mut self,
        command: Option<&str>,
        timeout: Option<Duration>,
    ) -> DynResult<Vec<String>> {
        let mut responses = Vec::new();

        // Drain anything queued by unrelated prior activity so the wait
        // below really waits for this command's response.
        while let Ok(line) = self.responses.try_recv() {
            responses.push(line);
        }

        debug!("send_command({:?}, {:?})", command, timeout);

        if let Some(command) = command {
            trace!(">> {command}");
            self.writer.write_all(command.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut found = false;
        loop {
            let popped = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match time::timeout(deadline - now, self.responses.recv()).await {
                        Ok(popped) => popped,
                        Err(_) => break,
                    }
                }
                None => self.responses.recv().await,
            };
            let Some(line) = popped else {
                // The reader is gone; a racing disconnect must surface as
                // an error rather than a hang or a garbled response.
                if let Some(command) = command {
                    return Err(MachineError::io(format!(
                        "connection closed while waiting for response to {command:?}"
                    ))
                    .into());
                }
                break;
            };
            let confirmed = self.confirm.is_match(&line);
            responses.push(line);
            if confirmed {
                found = true;
                break;
            }
        }

        if let Some(command) = command {
            if !found {
                return Err(MachineError::timeout(command).into());
            }
        }

        // Pick up any burst that followed the confirmation.
        while let Ok(line) = self.responses.try_recv() {
            responses.push(line);
        }

        debug!("send_command({:?}) => {:?}", command, responses);
        Ok(responses)
    }
}
