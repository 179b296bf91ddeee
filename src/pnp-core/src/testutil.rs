// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Scripted firmware for driver tests.
//!
//! Owns the far end of a `tokio::io::duplex` pair, answers every received
//! line according to a reply script, records all traffic, and can inject
//! unsolicited lines (position reports, boot noise). Dropping the handle
//! aborts the task, which closes the transport from the firmware side.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::split_stream;

pub(crate) struct Firmware {
    received: Arc<Mutex<Vec<String>>>,
    inject_tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl Firmware {
    /// Lines the firmware has received so far.
    pub(crate) fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Send an unsolicited line to the host.
    pub(crate) fn inject(&mut self, line: &str) {
        let _ = self.inject_tx.send(line.to_string());
    }
}

impl Drop for Firmware {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Firmware that replies to every received line with the script's output,
/// after an optional delay.
pub(crate) fn firmware_with(
    stream: DuplexStream,
    delay: Duration,
    mut reply: impl FnMut(&str) -> Vec<String> + Send + 'static,
) -> Firmware {
    let (mut read, mut write) = split_stream(stream);
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_task = received.clone();
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<String>();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                injected = inject_rx.recv() => {
                    let Some(line) = injected else { break };
                    let _ = write.write_all(format!("{line}\n").as_bytes()).await;
                }
                line = read.read_line(Duration::from_millis(100)) => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => continue,
                        Err(_) => break,
                    };
                    received_task.lock().unwrap().push(line.clone());
                    let replies = reply(&line);
                    if !replies.is_empty() && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    for reply in replies {
                        let _ = write.write_all(format!("{reply}\n").as_bytes()).await;
                    }
                }
            }
        }
    });

    Firmware {
        received,
        inject_tx,
        task,
    }
}

/// Firmware that answers `ok` to everything.
pub(crate) fn ok_firmware(stream: DuplexStream) -> Firmware {
    scripted_firmware(stream, |_| vec!["ok".to_string()])
}

/// Firmware with a custom reply script and no delay.
pub(crate) fn scripted_firmware(
    stream: DuplexStream,
    reply: impl FnMut(&str) -> Vec<String> + Send + 'static,
) -> Firmware {
    firmware_with(stream, Duration::ZERO, reply)
}

/// Firmware that answers `ok` after a fixed delay.
pub(crate) fn delayed_ok_firmware(stream: DuplexStream, delay: Duration) -> Firmware {
    firmware_with(stream, delay, |_| vec!["ok".to_string()])
}
