// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! MicroPython Raw REPL / Raw-Paste codec.
//!
//! Drives the board through the documented interactive modes
//! (<https://docs.micropython.org/en/latest/reference/repl.html>):
//! friendly REPL for human interaction, raw REPL for deterministic code
//! execution, and the flow-controlled Raw-Paste extension for bulk payloads.
//! Output is terminated by `\x04` markers separating stdout from stderr.

pub mod paste;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ReplError, Result};
use crate::transport::Transport;

pub const CTRL_A: u8 = 0x01; // enter raw REPL
pub const CTRL_B: u8 = 0x02; // exit to friendly REPL
pub const CTRL_C: u8 = 0x03; // interrupt
pub const CTRL_D: u8 = 0x04; // soft reset / EOF marker
pub const CTRL_E: u8 = 0x05; // raw-paste entry

pub const EOF: u8 = CTRL_D;
pub const RAW_PROMPT: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
pub const SOFT_REBOOT: &[u8] = b"soft reboot\r\n";
pub const FRIENDLY_PROMPT: &[u8] = b">>>";
const OK_RESPONSE: &[u8] = b"OK";

const ENTER_TIMEOUT: Duration = Duration::from_secs(3);
const TRAILER_TIMEOUT: Duration = Duration::from_secs(5);
const PROMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read deadline for [`RawRepl::read_until`].
#[derive(Debug, Clone, Copy)]
pub enum ReadLimit {
    /// Absolute deadline from the start of the read.
    Hard(Duration),
    /// No absolute deadline while data is flowing; used for stdout of a
    /// running program. Disconnects still surface through the transport.
    Flowing,
}

/// Streaming consumer for stdout bytes as they arrive.
pub trait OutputSink: Send {
    fn write(&mut self, data: &[u8]);
}

impl<F: FnMut(&[u8]) + Send> OutputSink for F {
    fn write(&mut self, data: &[u8]) {
        self(data)
    }
}

/// Non-blocking provider of user keystrokes for interactive execution.
pub trait InputSource: Send {
    fn poll(&mut self) -> Option<Vec<u8>>;
}

/// Per-exec I/O wiring.
#[derive(Default)]
pub struct ExecIo<'a> {
    pub sink: Option<&'a mut dyn OutputSink>,
    pub input: Option<&'a mut dyn InputSource>,
    /// Return right after the device accepts the payload, without waiting
    /// for output.
    pub detach: bool,
}

impl<'a> ExecIo<'a> {
    pub fn detached() -> Self {
        Self { sink: None, input: None, detach: true }
    }
}

/// Raw-REPL protocol driver for one serial connection.
///
/// Owns the transport; all methods are blocking and run on the blocking pool
/// under the connection mutex.
pub struct RawRepl {
    transport: Box<dyn Transport>,
    /// Bytes read past a match, replayed before the next transport read.
    pushback: Vec<u8>,
    /// Raw-Paste support, cached after the first negotiation.
    raw_paste: Option<bool>,
    /// Raw-Paste window increment from the last negotiation.
    window_increment: u16,
    /// Cooperatively polled interrupt request (`Ctrl-C` pending).
    interrupt: Arc<AtomicBool>,
    /// Primary core name; a few recovery paths are core-keyed.
    core: String,
}

impl RawRepl {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            pushback: Vec::new(),
            raw_paste: None,
            window_increment: 128,
            interrupt: Arc::new(AtomicBool::new(false)),
            core: String::new(),
        }
    }

    pub fn set_core(&mut self, core: &str) {
        self.core = core.to_owned();
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Queue an interrupt: set the flag and send one `Ctrl-C` to the device.
    pub fn request_interrupt(&mut self) {
        self.interrupt.store(true, Ordering::SeqCst);
        let _ = self.transport.write(&[CTRL_C]);
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    pub(crate) fn raw_paste_cached(&self) -> Option<bool> {
        self.raw_paste
    }

    pub(crate) fn set_raw_paste(&mut self, supported: bool) {
        self.raw_paste = Some(supported);
    }

    pub(crate) fn window_increment(&self) -> u16 {
        self.window_increment
    }

    pub(crate) fn set_window_increment(&mut self, increment: u16) {
        self.window_increment = increment;
    }

    // -- low-level reads -----------------------------------------------------

    pub(crate) fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.transport.write(data).map(|_| ())
    }

    /// Read up to `max` bytes, consuming pushback first.
    pub(crate) fn read_some(&mut self, max: usize) -> Result<Vec<u8>> {
        if !self.pushback.is_empty() {
            let take = max.min(self.pushback.len());
            let out: Vec<u8> = self.pushback.drain(..take).collect();
            return Ok(out);
        }
        self.transport.read(max)
    }

    /// Block for exactly `n` bytes or fail with `Timeout`.
    pub(crate) fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let chunk = self.read_some(n - out.len())?;
            if chunk.is_empty() {
                if Instant::now() >= deadline {
                    return Err(ReplError::timeout(format!(
                        "expected {n} bytes, got {} before deadline",
                        out.len()
                    )));
                }
                continue;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub(crate) fn push_back(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut rest = std::mem::take(&mut self.pushback);
        self.pushback = data.to_vec();
        self.pushback.append(&mut rest);
    }

    /// Read until `ending` appears in the stream.
    ///
    /// Returns the bytes before the marker; bytes read past it are pushed
    /// back. When `sink` is given, data is streamed as it arrives and only a
    /// matching tail is retained in memory. When `input` is given, pending
    /// keystrokes are forwarded between reads (interactive mode).
    pub(crate) fn read_until(
        &mut self,
        ending: &[u8],
        limit: ReadLimit,
        mut sink: Option<&mut dyn OutputSink>,
        mut input: Option<&mut dyn InputSource>,
    ) -> Result<Vec<u8>> {
        let deadline = match limit {
            ReadLimit::Hard(t) => Some(Instant::now() + t),
            ReadLimit::Flowing => None,
        };
        let tail_keep = ending.len().max(8) + 8;

        // With a sink, `data` only retains an unsunk tail large enough to
        // match the marker; everything before it has been streamed already.
        let mut data: Vec<u8> = Vec::new();
        // Double-Ctrl-C tracking for interactive aborts.
        let mut ctrl_c_pending = false;

        loop {
            // Forward any pending interactive input.
            if let Some(src) = input.as_deref_mut() {
                while let Some(bytes) = src.poll() {
                    for &b in &bytes {
                        if b == CTRL_C {
                            if ctrl_c_pending {
                                // Second Ctrl-C with no device output in
                                // between: abort client-side, device already
                                // got exactly one interrupt.
                                return Err(ReplError::interrupted());
                            }
                            ctrl_c_pending = true;
                            self.interrupt.store(true, Ordering::SeqCst);
                            self.transport.write(&[CTRL_C])?;
                        } else {
                            let byte = if b == b'\n' { b'\r' } else { b };
                            self.transport.write(&[byte])?;
                        }
                    }
                }
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(ReplError::timeout(format!(
                        "marker {:02x?} not seen before deadline",
                        ending
                    )));
                }
            }

            // Interactive reads stay non-blocking so keystrokes are not
            // stuck behind the serial read timeout.
            let chunk = if input.is_some() && self.pushback.is_empty() {
                if self.transport.in_waiting()? == 0 {
                    std::thread::sleep(Duration::from_millis(5));
                    Vec::new()
                } else {
                    self.transport.read(256)?
                }
            } else {
                self.read_some(256)?
            };
            if chunk.is_empty() {
                // Quiet link; probe so unplugs surface even in flowing mode.
                self.transport.in_waiting()?;
                continue;
            }
            ctrl_c_pending = false;

            let prev_len = data.len();
            data.extend_from_slice(&chunk);

            let search_from = prev_len.saturating_sub(ending.len().saturating_sub(1));
            if let Some(found) = find(&data[search_from..], ending) {
                let end = search_from + found + ending.len();
                let body_end = end - ending.len();
                if end < data.len() {
                    let tail = data[end..].to_vec();
                    self.push_back(&tail);
                }
                if let Some(s) = sink.as_deref_mut() {
                    // Flush the retained tail up to the marker.
                    if body_end > 0 {
                        s.write(&data[..body_end]);
                    }
                    return Ok(Vec::new());
                }
                data.truncate(body_end);
                return Ok(data);
            }

            if let Some(s) = sink.as_deref_mut() {
                // No match: everything except a matching tail is safe to
                // stream and drop.
                let safe_end = data.len().saturating_sub(tail_keep);
                if safe_end > 0 {
                    s.write(&data[..safe_end]);
                    data.drain(..safe_end);
                }
            }
        }
    }

    // -- mode transitions ----------------------------------------------------

    /// Enter raw REPL using the documented handshake. Two retries.
    ///
    /// Leaves the final `>` of the raw prompt unread; `exec` consumes it.
    pub fn enter_raw(&mut self, soft_reset: bool) -> Result<()> {
        debug!("enter raw repl (soft_reset={soft_reset})");
        let mut last = ReplError::enter_raw_failed("could not enter raw repl");
        for attempt in 1..=2u8 {
            let _ = self.transport.reset_input_buffer();
            self.pushback.clear();

            self.write_all(&[b'\r', CTRL_C, CTRL_C])?;
            std::thread::sleep(Duration::from_millis(50));
            let _ = self.transport.reset_input_buffer();
            self.pushback.clear();

            self.write_all(&[b'\r', CTRL_A])?;

            let result = (|| -> Result<()> {
                if soft_reset {
                    self.read_until(RAW_PROMPT, ReadLimit::Hard(ENTER_TIMEOUT), None, None)?;
                    self.write_all(&[CTRL_D])?;
                    self.read_until(SOFT_REBOOT, ReadLimit::Hard(ENTER_TIMEOUT), None, None)?;
                }
                // Prompt without the trailing '>'.
                self.read_until(
                    &RAW_PROMPT[..RAW_PROMPT.len() - 1],
                    ReadLimit::Hard(ENTER_TIMEOUT),
                    None,
                    None,
                )?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    debug!("raw repl entered");
                    return Ok(());
                }
                Err(e) if e.kind.connection_fatal() => return Err(e),
                Err(e) => {
                    debug!(attempt, err = %e, "enter raw retry");
                    last = ReplError::enter_raw_failed(e.detail);
                    // Back to friendly before the next attempt.
                    let _ = self.write_all(&[b'\r', CTRL_B]);
                    std::thread::sleep(Duration::from_millis(120));
                }
            }
        }
        Err(last)
    }

    /// Leave raw REPL for the friendly prompt.
    pub fn exit_raw(&mut self) -> Result<()> {
        self.write_all(&[b'\r', CTRL_B])
    }

    /// Enter the friendly REPL and wait for its prompt.
    pub fn enter_friendly(&mut self) -> Result<()> {
        self.write_all(&[b'\r', CTRL_B])?;
        self.read_until(FRIENDLY_PROMPT, ReadLimit::Hard(ENTER_TIMEOUT), None, None)?;
        Ok(())
    }

    /// Restore raw REPL from an attached friendly session.
    pub fn exit_friendly(&mut self) -> Result<()> {
        self.write_all(&[b'\r', CTRL_C, CTRL_A])?;
        // Tolerate a missing prompt; the next enter_raw recovers.
        match self.read_until(
            &RAW_PROMPT[..RAW_PROMPT.len() - 1],
            ReadLimit::Hard(Duration::from_secs(1)),
            None,
            None,
        ) {
            Ok(_) => {}
            Err(e) if e.kind.connection_fatal() => return Err(e),
            Err(_) => warn!("raw prompt not seen after leaving friendly repl"),
        }
        Ok(())
    }

    // -- execution -----------------------------------------------------------

    /// Execute `payload` in the current raw session and return its stdout.
    ///
    /// Tries Raw-Paste when the device supports it (negotiated once per
    /// connection), falling back to the legacy raw path. Device tracebacks
    /// surface as `DeviceError`; an interrupt suppresses the
    /// `KeyboardInterrupt` traceback and returns `Interrupted` semantics via
    /// the empty error channel.
    pub fn exec<'a>(&mut self, payload: &[u8], io: &'a mut ExecIo<'a>) -> Result<Vec<u8>> {
        self.interrupt.store(false, Ordering::SeqCst);

        // Consume the pending '>' prompt from enter_raw / previous exec.
        self.read_until(b">", ReadLimit::Hard(PROMPT_TIMEOUT), None, None)
            .map_err(|e| match e.kind {
                crate::error::ErrorKind::Timeout => {
                    ReplError::enter_raw_failed("no raw prompt before payload")
                }
                _ => e,
            })?;

        let plain = io.sink.is_none() && io.input.is_none() && !io.detach;
        if plain && self.raw_paste != Some(false) {
            match paste::exec_raw_paste(self, payload) {
                Ok(Some(outcome)) => return self.finish(outcome.stdout, outcome.stderr),
                // Clean refusal: device still at the raw prompt, use legacy.
                Ok(None) => {}
                Err(e) if e.kind.connection_fatal() => return Err(e),
                Err(e) => {
                    debug!(err = %e, "raw-paste failed, falling back to legacy raw mode");
                    self.raw_paste = Some(false);
                    self.recover_raw()?;
                }
            }
        }

        self.exec_legacy(payload, io)
    }

    /// Re-enter raw mode after a Raw-Paste failure and re-arm the prompt.
    fn recover_raw(&mut self) -> Result<()> {
        self.exit_raw()?;
        std::thread::sleep(Duration::from_millis(100));
        self.enter_raw(false)?;
        self.read_until(b">", ReadLimit::Hard(PROMPT_TIMEOUT), None, None)
            .map_err(|_| ReplError::enter_raw_failed("could not recover after raw-paste failure"))?;
        Ok(())
    }

    /// Legacy raw-mode execution: adaptive chunked send, `OK`, then the
    /// stdout/stderr `\x04` trailer.
    fn exec_legacy<'a>(&mut self, payload: &[u8], io: &'a mut ExecIo<'a>) -> Result<Vec<u8>> {
        let mut chunk_size = 1024usize;
        const MAX_CHUNK: usize = 8192;
        const MIN_CHUNK: usize = 512;

        let started = Instant::now();
        let mut sent = 0usize;
        while sent < payload.len() {
            let end = (sent + chunk_size).min(payload.len());
            let chunk_started = Instant::now();
            self.write_all(&payload[sent..end])?;
            let elapsed = chunk_started.elapsed();
            sent = end;

            // Fast ACKs grow the chunk, slow ones shrink it.
            if elapsed < Duration::from_millis(10) && chunk_size < MAX_CHUNK {
                chunk_size = (chunk_size * 2).min(MAX_CHUNK);
            } else if elapsed > Duration::from_millis(50) {
                chunk_size = (chunk_size / 2).max(MIN_CHUNK);
            }

            // Give slow USB stacks a breather.
            if sent % (32 * 1024) == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        self.write_all(&[EOF])?;

        let transfer = started.elapsed();
        let ok_timeout = TRAILER_TIMEOUT.max(transfer * 2);
        self.read_until(OK_RESPONSE, ReadLimit::Hard(ok_timeout), None, None)
            .map_err(|_| ReplError::enter_raw_failed("no OK after payload"))?;

        if io.detach {
            return Ok(Vec::new());
        }

        let interactive = io.input.is_some();
        let stdout = self.read_until(
            &[EOF],
            ReadLimit::Flowing,
            io.sink.as_deref_mut(),
            io.input.as_deref_mut(),
        )?;

        let stderr = match self.read_until(&[EOF], ReadLimit::Hard(TRAILER_TIMEOUT), None, None) {
            Ok(data) => data,
            Err(e) if e.kind.connection_fatal() => return Err(e),
            Err(_) if self.interrupt.load(Ordering::SeqCst) => Vec::new(),
            Err(e) => return Err(ReplError::timeout(format!("waiting for stderr EOF: {}", e.detail))),
        };

        if interactive {
            // Leave the device in a clean raw prompt after an interactive
            // run; an interrupt may have left partial state behind.
            if self.interrupt.load(Ordering::SeqCst) && self.core != "EFR32MG" {
                let _ = self.write_all(&[b'\r', CTRL_B]);
                std::thread::sleep(Duration::from_millis(80));
                let _ = self.write_all(&[b'\r', CTRL_A]);
                // The prompt's trailing '>' stays unread for the next exec.
                let _ = self.read_until(
                    &RAW_PROMPT[..RAW_PROMPT.len() - 1],
                    ReadLimit::Hard(Duration::from_secs(1)),
                    None,
                    None,
                );
            }
        }

        self.finish(stdout, stderr)
    }

    /// Shared exec epilogue: interrupt suppression and the error channel.
    fn finish(&mut self, stdout: Vec<u8>, stderr: Vec<u8>) -> Result<Vec<u8>> {
        let interrupted = self.interrupt.swap(false, Ordering::SeqCst);
        if !stderr.is_empty() {
            if interrupted {
                // Interrupt tracebacks are expected noise; drop them.
                return Ok(stdout);
            }
            return Err(ReplError::device(String::from_utf8_lossy(&stderr).into_owned()));
        }
        Ok(stdout)
    }

    /// Convenience: full enter/exec/leave cycle for one snippet.
    pub fn exec_snippet(&mut self, code: &str) -> Result<Vec<u8>> {
        self.enter_raw(true)?;
        let result = self.exec(code.as_bytes(), &mut ExecIo::default());
        let leave = self.exit_raw();
        let out = result?;
        leave?;
        Ok(out)
    }

    /// Soft-reset the board (`Ctrl-D` at the prompt).
    pub fn soft_reset(&mut self) -> Result<()> {
        self.write_all(&[b'\r', CTRL_D])
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
