// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed request arguments, one closed struct per command.
//!
//! Validation happens at the envelope boundary: unknown fields are rejected
//! and missing required fields become `ValidationError` responses.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ReplError, Result};

/// Parse a command's `args` object into its typed form.
pub fn parse<T: DeserializeOwned>(args: &Value) -> Result<T> {
    let value = if args.is_null() { Value::Object(Default::default()) } else { args.clone() };
    serde_json::from_value(value)
        .map_err(|e| ReplError::validation(format!("invalid arguments: {e}")))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecArgs {
    pub code: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunArgs {
    /// Inline code, or...
    pub code: Option<String>,
    /// ...a local script path read by the agent.
    pub local: Option<String>,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub interactive: bool,
}

impl RunArgs {
    pub fn payload(&self) -> Result<Vec<u8>> {
        match (&self.code, &self.local) {
            (Some(code), None) => Ok(code.clone().into_bytes()),
            (None, Some(local)) => std::fs::read(local)
                .map_err(|e| ReplError::validation(format!("cannot read {local}: {e}"))),
            _ => Err(ReplError::validation("exactly one of code or local is required")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSetupArgs {
    #[serde(default = "default_true")]
    pub as_foreground: bool,
    pub core: Option<String>,
    pub device: Option<String>,
    pub local_default: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetDefaultArgs {
    pub port: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LsArgs {
    pub path: Option<String>,
    /// Accepted for compatibility; listings always carry size and kind.
    #[serde(default = "default_true")]
    pub detailed: bool,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SrcDstArgs {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferArgs {
    pub remote_path: String,
    pub local_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetFileArgs {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PutFileArgs {
    pub path: String,
    /// Base64-encoded content; bounded by the envelope payload limit.
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplWriteArgs {
    /// Base64-encoded keystrokes.
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplReadArgs {
    #[serde(default = "default_repl_read_max")]
    pub max: usize,
}

fn default_true() -> bool {
    true
}

fn default_repl_read_max() -> usize {
    4096
}

#[cfg(test)]
#[path = "args_tests.rs"]
mod tests;
