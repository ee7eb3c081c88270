// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Byte-oriented duplex channel over a serial port.
//!
//! Every operation classifies platform "device removed" error strings into a
//! single `Disconnected` error so upper layers react uniformly.

pub mod serial;

use crate::error::Result;
use crate::port::PortKey;

/// Object-safe transport over a serial link.
///
/// Reads are bounded by the port's configured timeout and may return fewer
/// bytes than requested (including none); the codec loops as needed.
pub trait Transport: Send {
    /// Write all of `data`, returning the byte count.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read up to `n` bytes, waiting at most the port timeout.
    fn read(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Read whatever is already buffered without waiting.
    fn read_available(&mut self) -> Result<Vec<u8>>;

    /// Bytes currently buffered by the OS.
    fn in_waiting(&mut self) -> Result<usize>;

    fn reset_input_buffer(&mut self) -> Result<()>;

    fn reset_output_buffer(&mut self) -> Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Probe the port; returns `Disconnected` if the device is gone.
    /// Higher layers call this as a heartbeat.
    fn keep_alive(&mut self) -> Result<()>;
}

/// Opens transports for ports; lets tests substitute a scripted board.
pub trait TransportFactory: Send + Sync {
    fn open(&self, port: &PortKey) -> Result<Box<dyn Transport>>;
}

/// Whether a platform error string means the device was removed.
///
/// Covers the strings Windows (`ClearCommError`, `does not exist`,
/// `cannot find`, `Access is denied`) and POSIX (`Device not configured`,
/// `No such device`, `Errno 6`) produce when the cable is unplugged.
pub fn is_disconnect_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    const NEEDLES: &[&str] = &[
        "clearcommerror",
        "does not exist",
        "not exist",
        "cannot find",
        "access is denied",
        "device not configured",
        "no such device",
        "errno 6",
        "device disconnected",
        "broken pipe",
    ];
    NEEDLES.iter().any(|n| lower.contains(n))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
