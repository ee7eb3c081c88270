// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Raw-Paste mode: host→device flow control for bulk payloads.
//!
//! Negotiated per execution; support is cached per connection after the first
//! probe. Protocol (MicroPython v1.13+): send `\x05A\x01`, read two bytes —
//! `R\x01` plus a little-endian u16 window increment means supported,
//! `R\x00` means refused, anything starting with `r` is a legacy device
//! echoing its prompt.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ReplError, Result};
use crate::repl::{RawRepl, ReadLimit, EOF};

const RAW_PASTE_INIT: &[u8] = &[0x05, b'A', 0x01];
const SUPPORTED: &[u8] = b"R\x01";
const NOT_SUPPORTED: &[u8] = b"R\x00";
/// Flow control: device grants one more window increment.
const WINDOW_INC: u8 = 0x01;
/// Flow control: device wants the host to stop sending.
const END_DATA: u8 = 0x04;

const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(2);
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const FLOW_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct PasteOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Negotiate raw-paste for this execution.
///
/// Returns `Ok(true)` when the device entered raw-paste mode, `Ok(false)`
/// when it refused (caller proceeds via legacy raw), `Err` on a wire fault.
fn negotiate(repl: &mut RawRepl) -> Result<bool> {
    repl.write_all(RAW_PASTE_INIT)?;
    let response = repl.read_exact(2, NEGOTIATE_TIMEOUT)?;

    if response == SUPPORTED {
        let window = repl.read_exact(2, NEGOTIATE_TIMEOUT)?;
        let increment = u16::from_le_bytes([window[0], window[1]]);
        if increment == 0 {
            // A zero window can never drain; treat as unsupported.
            warn!("raw-paste window increment of 0, treating as unsupported");
            repl.set_raw_paste(false);
            return Err(ReplError::raw_paste("device offered a zero window"));
        }
        debug!(increment, "raw-paste negotiated");
        repl.set_window_increment(increment);
        repl.set_raw_paste(true);
        return Ok(true);
    }

    if response == NOT_SUPPORTED {
        debug!("device refuses raw-paste this session");
        repl.set_raw_paste(false);
        return Ok(false);
    }

    if response.first() == Some(&b'r') {
        // Legacy device echoing "raw REPL; ..."; drain the prompt.
        debug!("legacy device without raw-paste, draining prompt");
        let _ = repl.read_until(b">", ReadLimit::Hard(Duration::from_secs(1)), None, None);
        repl.set_raw_paste(false);
        return Ok(false);
    }

    repl.set_raw_paste(false);
    Err(ReplError::raw_paste(format!("unexpected negotiation response {response:02x?}")))
}

/// Execute `payload` through raw-paste with flow control.
///
/// Returns `Ok(None)` when the device cleanly refused raw-paste (it is still
/// sitting at the raw prompt and the caller proceeds via legacy raw).
///
/// The cumulative send never exceeds the device-granted window: the initial
/// window is `2 × increment` and each `\x01` grants one more increment. A
/// mid-transfer `\x04` from the device aborts the send; the host replies with
/// exactly one `\x04` and proceeds to read the ACK/stdout/stderr trailer.
pub fn exec_raw_paste(repl: &mut RawRepl, payload: &[u8]) -> Result<Option<PasteOutcome>> {
    if !negotiate(repl)? {
        return Ok(None);
    }

    let increment = repl.window_increment() as usize;
    let mut remaining = increment * 2;
    let mut sent = 0usize;
    let mut device_ended = false;

    while sent < payload.len() {
        while remaining == 0 {
            let fc = repl.read_exact(1, FLOW_TIMEOUT).map_err(|e| match e.kind {
                crate::error::ErrorKind::Timeout => {
                    ReplError::raw_paste("flow control stalled (no window grant)")
                }
                _ => e,
            })?;
            match fc[0] {
                WINDOW_INC => remaining += increment,
                END_DATA => {
                    debug!(sent, "device ended reception mid-transfer");
                    device_ended = true;
                    break;
                }
                other => {
                    return Err(ReplError::raw_paste(format!(
                        "unexpected flow control byte {other:#04x}"
                    )))
                }
            }
        }
        if device_ended {
            break;
        }

        let chunk = remaining.min(payload.len() - sent);
        repl.write_all(&payload[sent..sent + chunk])?;
        sent += chunk;
        remaining -= chunk;

        // Opportunistically drain a pending flow-control byte.
        if repl.transport_mut().in_waiting()? > 0 {
            let fc = repl.read_some(1)?;
            match fc.first() {
                Some(&WINDOW_INC) => remaining += increment,
                Some(&END_DATA) => {
                    debug!(sent, "device ended reception (early)");
                    device_ended = true;
                    break;
                }
                Some(_) | None => {}
            }
        }
    }

    // Exactly one terminating EOF, whether we finished or the device aborted.
    repl.write_all(&[EOF])?;

    // Compilation ACK.
    repl.read_until(&[EOF], ReadLimit::Hard(ACK_TIMEOUT), None, None).map_err(|e| {
        match e.kind {
            crate::error::ErrorKind::Timeout => {
                ReplError::raw_paste("compilation acknowledgment timeout")
            }
            _ => e,
        }
    })?;

    let stdout = repl.read_until(&[EOF], ReadLimit::Flowing, None, None)?;
    let stderr = repl.read_until(&[EOF], ReadLimit::Hard(ACK_TIMEOUT), None, None).map_err(|e| {
        match e.kind {
            crate::error::ErrorKind::Timeout => ReplError::raw_paste("stderr trailer timeout"),
            _ => e,
        }
    })?;

    let prompt = repl.read_exact(1, Duration::from_secs(1)).unwrap_or_default();
    if prompt != b">" {
        warn!(got = ?prompt, "expected '>' prompt after raw-paste execution");
    }
    // Re-arm the prompt so the next exec's initial read finds it.
    repl.push_back(&prompt);

    Ok(Some(PasteOutcome { stdout, stderr }))
}

#[cfg(test)]
#[path = "paste_tests.rs"]
mod tests;
