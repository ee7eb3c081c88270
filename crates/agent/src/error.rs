// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error kinds carried inside the core.
///
/// Kind names are the wire prefix: the server serializes an error as
/// `"<kind>: <detail>"` and the client matches on the prefix to decide
/// whether the failure is recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Serial device removed or cable unplugged.
    Disconnected,
    /// Could not reach the raw REPL prompt after retries.
    EnterRawFailed,
    /// Raw-Paste negotiation or acknowledgment failed.
    RawPasteError,
    /// The board returned a traceback on its error channel.
    DeviceError,
    /// Deadline exceeded waiting for the device.
    Timeout,
    /// Busy-state rules forbid the command right now.
    Busy,
    /// The user requested an abort.
    Interrupted,
    /// Malformed request arguments.
    ValidationError,
    /// No connection exists for the target port.
    NotConnected,
    /// Malformed envelope or magic mismatch.
    ProtocolError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::EnterRawFailed => "EnterRawFailed",
            Self::RawPasteError => "RawPasteError",
            Self::DeviceError => "DeviceError",
            Self::Timeout => "Timeout",
            Self::Busy => "Busy",
            Self::Interrupted => "Interrupted",
            Self::ValidationError => "ValidationError",
            Self::NotConnected => "NotConnected",
            Self::ProtocolError => "ProtocolError",
        }
    }

    /// Whether the failure leaves the connection usable.
    ///
    /// `Disconnected` tears the connection down; everything else is fatal at
    /// most to the current request.
    pub fn connection_fatal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error: a kind plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ReplError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn disconnected(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, detail)
    }

    pub fn enter_raw_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::EnterRawFailed, detail)
    }

    pub fn raw_paste(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::RawPasteError, detail)
    }

    /// Board traceback, returned verbatim to the caller.
    pub fn device(traceback: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceError, traceback)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, detail)
    }

    pub fn busy(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, detail)
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorKind::Interrupted, "execution interrupted")
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, detail)
    }

    pub fn not_connected(port: &str) -> Self {
        Self::new(ErrorKind::NotConnected, format!("Not connected: {port}"))
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, detail)
    }

    /// Wire form: `"<kind>: <detail>"`.
    pub fn to_wire(&self) -> String {
        format!("{}: {}", self.kind.as_str(), self.detail)
    }
}

impl fmt::Display for ReplError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

impl std::error::Error for ReplError {}

pub type Result<T> = std::result::Result<T, ReplError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
