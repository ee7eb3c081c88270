// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted MicroPython board simulator for tests.
//!
//! Implements [`Transport`] over an in-memory state machine that speaks the
//! friendly/raw/raw-paste protocol, so codec, connection, and end-to-end
//! tests run against realistic wire traffic without hardware.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ReplError, Result};
use crate::port::PortKey;
use crate::repl::{CTRL_A, CTRL_B, CTRL_C, CTRL_D, CTRL_E};
use crate::transport::{Transport, TransportFactory};

pub const DEFAULT_BANNER: &str =
    "MicroPython v1.24.1 on 2025-01-02; Raspberry Pi Pico 2 W with RP2350";

const RAW_PROMPT: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
const KEYBOARD_INTERRUPT: &[u8] =
    b"Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nKeyboardInterrupt: \r\n";

/// How the simulated board answers a raw-paste probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPasteBehavior {
    /// `R\x01` plus the given window increment.
    Supported { increment: u16 },
    /// `R\x00`.
    Refuse,
    /// Legacy firmware that echoes its raw prompt.
    Legacy,
    /// `R\x01` with a zero increment.
    ZeroWindow,
    /// Supported, but the board sends `\x04` (end reception) once it has
    /// received this many payload bytes.
    AbortAfter { increment: u16, bytes: usize },
}

/// Result of running a payload on the simulated board.
pub enum ScriptResult {
    /// Finish immediately with the given output channels.
    Output { stdout: Vec<u8>, stderr: Vec<u8> },
    /// Keep running until interrupted; bytes written by the host are echoed
    /// to stdout when `echo` is set.
    Running { echo: bool },
}

impl ScriptResult {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self::Output { stdout: stdout.into(), stderr: Vec::new() }
    }

    pub fn err(stderr: impl Into<Vec<u8>>) -> Self {
        Self::Output { stdout: Vec::new(), stderr: stderr.into() }
    }
}

type ExecHandler = Box<dyn FnMut(&[u8]) -> ScriptResult + Send>;

pub struct FakeBoardConfig {
    pub banner: String,
    pub raw_paste: RawPasteBehavior,
    /// Invoked with the raw payload when the board finishes receiving it.
    pub exec: ExecHandler,
    /// Artificial execution time, to widen busy windows in tests.
    pub exec_delay: Duration,
}

impl Default for FakeBoardConfig {
    fn default() -> Self {
        Self {
            banner: DEFAULT_BANNER.to_owned(),
            raw_paste: RawPasteBehavior::Supported { increment: 128 },
            exec: Box::new(|_| ScriptResult::ok("")),
            exec_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Friendly,
    RawPrompt,
    RawPasteInit { matched: usize },
    RawPayload,
    RawPaste,
    Running { echo: bool },
}

struct BoardInner {
    config: FakeBoardConfig,
    mode: Mode,
    /// Bytes queued for the host to read.
    rx: Vec<u8>,
    /// Accumulated payload for the current execution.
    payload: Vec<u8>,
    /// Raw-paste accounting.
    paste_received: usize,
    paste_granted: usize,
    paste_aborted: bool,
    /// True if the host ever exceeded the granted raw-paste window.
    window_violation: bool,
    /// Terminating `\x04` count received while in raw-paste mode.
    paste_eofs: usize,
    /// Every byte the host ever wrote.
    writes: Vec<u8>,
    interrupts: u32,
    unplugged: bool,
}

impl BoardInner {
    fn increment(&self) -> usize {
        match self.config.raw_paste {
            RawPasteBehavior::Supported { increment }
            | RawPasteBehavior::AbortAfter { increment, .. } => increment as usize,
            _ => 0,
        }
    }

    fn emit_friendly_prompt(&mut self) {
        self.rx.extend_from_slice(b"\r\n");
        self.rx.extend_from_slice(self.config.banner.as_bytes());
        self.rx.extend_from_slice(b"\r\n>>> ");
    }

    fn complete_exec(&mut self, legacy: bool) {
        if !self.config.exec_delay.is_zero() {
            std::thread::sleep(self.config.exec_delay);
        }
        let payload = std::mem::take(&mut self.payload);
        let result = (self.config.exec)(&payload);
        if legacy {
            self.rx.extend_from_slice(b"OK");
        } else {
            // Raw-paste compile acknowledgment.
            self.rx.push(0x04);
        }
        match result {
            ScriptResult::Output { stdout, stderr } => {
                self.rx.extend_from_slice(&stdout);
                self.rx.push(0x04);
                self.rx.extend_from_slice(&stderr);
                self.rx.push(0x04);
                self.rx.push(b'>');
                self.mode = Mode::RawPrompt;
            }
            ScriptResult::Running { echo } => {
                self.mode = Mode::Running { echo };
            }
        }
    }

    fn finish_interrupted(&mut self) {
        self.interrupts += 1;
        self.rx.push(0x04);
        self.rx.extend_from_slice(KEYBOARD_INTERRUPT);
        self.rx.push(0x04);
        self.rx.push(b'>');
        self.mode = Mode::RawPrompt;
    }

    fn feed(&mut self, byte: u8) {
        match self.mode {
            Mode::Friendly => match byte {
                CTRL_A => {
                    self.rx.extend_from_slice(RAW_PROMPT);
                    self.mode = Mode::RawPrompt;
                    self.payload.clear();
                }
                CTRL_B => self.emit_friendly_prompt(),
                CTRL_C => self.rx.extend_from_slice(b"\r\n>>> "),
                CTRL_D => self.emit_friendly_prompt(),
                b'\r' => self.rx.extend_from_slice(b"\r\n>>> "),
                other => self.rx.push(other),
            },
            Mode::RawPrompt => match byte {
                CTRL_E => self.mode = Mode::RawPasteInit { matched: 1 },
                CTRL_A => self.rx.extend_from_slice(RAW_PROMPT),
                CTRL_B => {
                    self.emit_friendly_prompt();
                    self.mode = Mode::Friendly;
                }
                CTRL_C => {}
                CTRL_D => {
                    // Soft reset at the prompt.
                    self.rx.extend_from_slice(b"soft reboot\r\n");
                    self.rx.extend_from_slice(self.config.banner.as_bytes());
                    self.rx.extend_from_slice(b"\r\n");
                    self.rx.extend_from_slice(RAW_PROMPT);
                }
                b'\r' => {}
                other => {
                    self.payload.clear();
                    self.payload.push(other);
                    self.mode = Mode::RawPayload;
                }
            },
            Mode::RawPasteInit { matched } => {
                let expected = [CTRL_E, b'A', CTRL_A];
                if byte == expected[matched] {
                    if matched == 2 {
                        self.start_raw_paste();
                    } else {
                        self.mode = Mode::RawPasteInit { matched: matched + 1 };
                    }
                } else {
                    // Not a raw-paste probe after all; treat as payload.
                    self.payload.clear();
                    self.payload.push(byte);
                    self.mode = Mode::RawPayload;
                }
            }
            Mode::RawPayload => match byte {
                CTRL_D => self.complete_exec(true),
                other => self.payload.push(other),
            },
            Mode::RawPaste => match byte {
                0x04 => {
                    self.paste_eofs += 1;
                    self.complete_exec(false);
                }
                other => {
                    self.paste_received += 1;
                    let allowed = 2 * self.increment() + self.paste_granted * self.increment();
                    if self.paste_received > allowed {
                        self.window_violation = true;
                    }
                    self.payload.push(other);
                    if self.paste_aborted {
                        return;
                    }
                    if let RawPasteBehavior::AbortAfter { bytes, .. } = self.config.raw_paste {
                        if self.paste_received >= bytes {
                            self.rx.push(0x04);
                            self.paste_aborted = true;
                            return;
                        }
                    }
                    if self.increment() > 0 && self.paste_received % self.increment() == 0 {
                        self.rx.push(0x01);
                        self.paste_granted += 1;
                    }
                }
            },
            Mode::Running { echo } => match byte {
                CTRL_C => self.finish_interrupted(),
                other => {
                    if echo {
                        self.rx.push(other);
                    }
                }
            },
        }
    }

    fn start_raw_paste(&mut self) {
        match self.config.raw_paste {
            RawPasteBehavior::Supported { increment }
            | RawPasteBehavior::AbortAfter { increment, .. } => {
                self.rx.extend_from_slice(b"R\x01");
                self.rx.extend_from_slice(&increment.to_le_bytes());
                self.payload.clear();
                self.paste_received = 0;
                self.paste_granted = 0;
                self.paste_aborted = false;
                self.mode = Mode::RawPaste;
            }
            RawPasteBehavior::ZeroWindow => {
                self.rx.extend_from_slice(b"R\x01\x00\x00");
                self.mode = Mode::RawPrompt;
            }
            RawPasteBehavior::Refuse => {
                self.rx.extend_from_slice(b"R\x00");
                self.mode = Mode::RawPrompt;
            }
            RawPasteBehavior::Legacy => {
                self.rx.extend_from_slice(RAW_PROMPT);
                self.mode = Mode::RawPrompt;
            }
        }
    }
}

/// Shared handle for configuring and inspecting a simulated board.
#[derive(Clone)]
pub struct FakeBoardHandle {
    inner: Arc<Mutex<BoardInner>>,
}

impl FakeBoardHandle {
    pub fn new(config: FakeBoardConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BoardInner {
                config,
                mode: Mode::Friendly,
                rx: Vec::new(),
                payload: Vec::new(),
                paste_received: 0,
                paste_granted: 0,
                paste_aborted: false,
                window_violation: false,
                paste_eofs: 0,
                writes: Vec::new(),
                interrupts: 0,
                unplugged: false,
            })),
        }
    }

    pub fn transport(&self) -> FakeBoard {
        FakeBoard { inner: Arc::clone(&self.inner) }
    }

    /// Simulate yanking the cable.
    pub fn unplug(&self) {
        self.inner.lock().unplugged = true;
    }

    pub fn window_violation(&self) -> bool {
        self.inner.lock().window_violation
    }

    /// `Ctrl-C` interrupts delivered while a payload was running.
    pub fn interrupts(&self) -> u32 {
        self.inner.lock().interrupts
    }

    pub fn paste_eofs(&self) -> usize {
        self.inner.lock().paste_eofs
    }

    /// Count of a byte in everything the host wrote.
    pub fn writes_of(&self, byte: u8) -> usize {
        self.inner.lock().writes.iter().filter(|&&b| b == byte).count()
    }

    /// Queue bytes for the host to read, as if the board printed them.
    pub fn inject_output(&self, data: &[u8]) {
        self.inner.lock().rx.extend_from_slice(data);
    }
}

/// Transport half of a simulated board.
pub struct FakeBoard {
    inner: Arc<Mutex<BoardInner>>,
}

fn unplugged_err() -> ReplError {
    ReplError::disconnected("Serial port disconnected (device removed or cable unplugged)")
}

impl Transport for FakeBoard {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.unplugged {
            return Err(unplugged_err());
        }
        inner.writes.extend_from_slice(data);
        for &b in data {
            inner.feed(b);
        }
        Ok(data.len())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        {
            let mut inner = self.inner.lock();
            if inner.unplugged {
                return Err(unplugged_err());
            }
            if !inner.rx.is_empty() {
                let take = n.min(inner.rx.len());
                return Ok(inner.rx.drain(..take).collect());
            }
        }
        // Nothing queued; behave like a short read timeout.
        std::thread::sleep(Duration::from_millis(1));
        Ok(Vec::new())
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.unplugged {
            return Err(unplugged_err());
        }
        Ok(std::mem::take(&mut inner.rx))
    }

    fn in_waiting(&mut self) -> Result<usize> {
        let inner = self.inner.lock();
        if inner.unplugged {
            return Err(unplugged_err());
        }
        Ok(inner.rx.len())
    }

    fn reset_input_buffer(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.unplugged {
            return Err(unplugged_err());
        }
        inner.rx.clear();
        Ok(())
    }

    fn reset_output_buffer(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        !self.inner.lock().unplugged
    }

    fn keep_alive(&mut self) -> Result<()> {
        if self.inner.lock().unplugged {
            return Err(unplugged_err());
        }
        Ok(())
    }
}

/// Factory handing out transports for pre-registered fake boards.
#[derive(Default)]
pub struct FakeBoardFactory {
    boards: Mutex<HashMap<String, FakeBoardHandle>>,
}

impl FakeBoardFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a board under a port name and return its handle.
    pub fn add_board(&self, port: &str, config: FakeBoardConfig) -> FakeBoardHandle {
        let handle = FakeBoardHandle::new(config);
        self.boards.lock().insert(PortKey::new(port).canonical(), handle.clone());
        handle
    }

    pub fn handle(&self, port: &str) -> Option<FakeBoardHandle> {
        self.boards.lock().get(&PortKey::new(port).canonical()).cloned()
    }
}

impl TransportFactory for FakeBoardFactory {
    fn open(&self, port: &PortKey) -> Result<Box<dyn Transport>> {
        let boards = self.boards.lock();
        match boards.get(&port.canonical()) {
            Some(handle) => Ok(Box::new(handle.transport())),
            None => Err(ReplError::disconnected(format!("failed to open {port} (device not found)"))),
        }
    }
}
