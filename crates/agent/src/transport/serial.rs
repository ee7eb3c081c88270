// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::{Read, Write};
use std::time::Duration;

use tracing::debug;

use crate::error::{ReplError, Result};
use crate::port::PortKey;
use crate::transport::{is_disconnect_message, Transport, TransportFactory};

pub const DEFAULT_BAUD: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Blocking serial transport over the `serialport` crate.
///
/// All calls run on the blocking pool under the connection mutex, so short
/// read timeouts are the suspension granularity for interrupt polling.
pub struct SerialTransport {
    port_name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub fn open(key: &PortKey, baud: u32) -> Result<Self> {
        let port = serialport::new(key.display(), baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| classify(key.display(), &e.to_string()))?;
        debug!(port = %key, baud, "serial open ok");
        Ok(Self { port_name: key.display().to_owned(), port: Some(port) })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| ReplError::disconnected(format!("{} is closed", self.port_name)))
    }

    fn map_io(&self, err: &std::io::Error) -> ReplError {
        classify(&self.port_name, &err.to_string())
    }
}

fn classify(port: &str, message: &str) -> ReplError {
    if is_disconnect_message(message) {
        ReplError::disconnected("Serial port disconnected (device removed or cable unplugged)")
    } else {
        ReplError::disconnected(format!("failed on {port}: {message}"))
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port_mut()?;
        match port.write_all(data).and_then(|()| port.flush()) {
            Ok(()) => Ok(data.len()),
            Err(e) => Err(classify(&self.port_name, &e.to_string())),
        }
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let port = self.port_mut()?;
        let mut buf = vec![0u8; n.max(1)];
        match port.read(&mut buf) {
            Ok(read) => {
                buf.truncate(read);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(self.map_io(&e)),
        }
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        let waiting = self.in_waiting()?;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        let port = self.port_mut()?;
        let mut buf = vec![0u8; waiting];
        match port.read(&mut buf) {
            Ok(read) => {
                buf.truncate(read);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(self.map_io(&e)),
        }
    }

    fn in_waiting(&mut self) -> Result<usize> {
        let port = self.port_mut()?;
        match port.bytes_to_read() {
            Ok(n) => Ok(n as usize),
            Err(e) => {
                let msg = e.to_string();
                if is_disconnect_message(&msg) {
                    Err(ReplError::disconnected(
                        "Serial port disconnected (device removed or cable unplugged)",
                    ))
                } else {
                    Ok(0)
                }
            }
        }
    }

    fn reset_input_buffer(&mut self) -> Result<()> {
        let port = self.port_mut()?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| classify(&self.port_name, &e.to_string()))
    }

    fn reset_output_buffer(&mut self) -> Result<()> {
        let port = self.port_mut()?;
        port.clear(serialport::ClearBuffer::Output)
            .map_err(|e| classify(&self.port_name, &e.to_string()))
    }

    fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            let _ = port.clear(serialport::ClearBuffer::All);
            debug!(port = %self.port_name, "serial closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn keep_alive(&mut self) -> Result<()> {
        self.in_waiting().map(|_| ())
    }
}

/// Default factory: open a real serial port at 115200 baud.
pub struct SerialFactory {
    pub baud: u32,
}

impl Default for SerialFactory {
    fn default() -> Self {
        Self { baud: DEFAULT_BAUD }
    }
}

impl TransportFactory for SerialFactory {
    fn open(&self, port: &PortKey) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(port, self.baud)?))
    }
}
