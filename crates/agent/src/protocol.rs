// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol between front-end and agent.
//!
//! Every datagram is `RPLX | version u8 | length u32 BE | JSON envelope`.
//! Bulk file content never passes through the JSON layer; transfers exchange
//! local paths and the agent touches the local filesystem directly.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReplError;

pub const MAGIC: &[u8; 4] = b"RPLX";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 9;

/// Largest datagram either side will send.
pub const MAX_UDP_SIZE: usize = 60 * 1024;
/// Largest JSON payload accepted inside a frame.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;

/// Session identifier, derived client-side from the terminal ancestor process.
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Stdout,
    Stderr,
    Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Starting,
    Downloading,
    Done,
}

/// Structured payload of a `progress` stream envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub current: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProgressStatus>,
}

/// Stream payload: base64 text for stdout/stderr, a structured object for
/// progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamData {
    Text(String),
    Progress(ProgressEvent),
}

/// One wire message. `seq` is chosen by the client per request; streams and
/// the terminal response echo it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request {
        seq: u32,
        command: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        args: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        sid: Option<SessionId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<String>,
        /// Overall timeout the client allows for this request, in
        /// milliseconds; an `ack` extends the client deadline by this much.
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Response {
        seq: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ack {
        seq: u32,
    },
    Stream {
        seq: u32,
        stream_type: StreamType,
        data: StreamData,
    },
    Input {
        seq: u32,
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sid: Option<SessionId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<String>,
    },
}

impl Envelope {
    pub fn seq(&self) -> u32 {
        match self {
            Self::Request { seq, .. }
            | Self::Response { seq, .. }
            | Self::Ack { seq }
            | Self::Stream { seq, .. }
            | Self::Input { seq, .. } => *seq,
        }
    }

    pub fn response_ok(seq: u32, result: Value) -> Self {
        Self::Response { seq, result: Some(result), error: None }
    }

    pub fn response_err(seq: u32, error: &ReplError) -> Self {
        Self::Response { seq, result: None, error: Some(error.to_wire()) }
    }

    pub fn stream_bytes(seq: u32, stream_type: StreamType, data: &[u8]) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        Self::Stream { seq, stream_type, data: StreamData::Text(encoded) }
    }

    pub fn stream_progress(seq: u32, event: ProgressEvent) -> Self {
        Self::Stream { seq, stream_type: StreamType::Progress, data: StreamData::Progress(event) }
    }

    pub fn input(seq: u32, data: &[u8], sid: Option<SessionId>, port: Option<String>) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        Self::Input { seq, data: encoded, sid, port }
    }
}

/// Decode the base64 payload of a `stream` or `input` envelope.
pub fn decode_b64(data: &str) -> Result<Vec<u8>, ReplError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| ReplError::protocol(format!("invalid base64 payload: {e}")))
}

/// Frame-level decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bad magic, version, length, or JSON. Datagram is dropped silently.
    Malformed(String),
    /// Frame parsed but the JSON payload exceeds [`MAX_PAYLOAD_SIZE`].
    /// `seq` is recovered when possible so the server can answer.
    TooLarge { seq: Option<u32> },
}

/// Serialize an envelope into a framed datagram.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, ReplError> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|e| ReplError::protocol(format!("encode failed: {e}")))?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ReplError::validation(format!(
            "payload too large: {} bytes (max {MAX_PAYLOAD_SIZE})",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(MAGIC);
    frame.push(VERSION);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse a framed datagram into an envelope.
pub fn decode_frame(data: &[u8]) -> Result<Envelope, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::Malformed("short frame".to_owned()));
    }
    if &data[..4] != MAGIC {
        return Err(DecodeError::Malformed("magic mismatch".to_owned()));
    }
    if data[4] != VERSION {
        return Err(DecodeError::Malformed(format!("unsupported version {}", data[4])));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[5..9]);
    let length = u32::from_be_bytes(len_bytes) as usize;
    if data.len() < HEADER_LEN + length {
        return Err(DecodeError::Malformed("truncated frame".to_owned()));
    }
    let payload = &data[HEADER_LEN..HEADER_LEN + length];
    if length > MAX_PAYLOAD_SIZE {
        // Best effort: pull the seq out so the sender gets a proper error.
        let seq = serde_json::from_slice::<Value>(payload)
            .ok()
            .and_then(|v| v.get("seq").and_then(Value::as_u64))
            .and_then(|s| u32::try_from(s).ok());
        return Err(DecodeError::TooLarge { seq });
    }
    serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(format!("bad JSON: {e}")))
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
