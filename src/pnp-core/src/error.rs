// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt;

use serde::Serialize;

/// Failure categories surfaced by the driver and job layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// No confirming response within the time budget.
    Timeout,
    /// Transport write failed or the connection went away.
    Io,
    /// Operation not valid in the current state.
    InvalidState,
    /// Bad configuration data (e.g. an invalid pattern).
    Config,
}

/// Error type returned by machine operations.
#[derive(Debug, Clone, Serialize)]
pub struct MachineError {
    kind: ErrorKind,
    message: String,
}

impl MachineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A sent command that was never confirmed. Names the command so the
    /// operator can tell which template misfired.
    pub fn timeout(command: &str) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("timeout waiting for response to {command:?}"),
        )
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MachineError {}
