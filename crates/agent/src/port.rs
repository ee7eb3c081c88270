// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Platform-normalized serial port identifier.
///
/// Windows `COM*` names compare case-insensitively while display keeps the
/// OS-reported casing; everything else is byte-exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortKey {
    display: String,
}

impl PortKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { display: name.into() }
    }

    /// OS-reported name, used for display and for opening the port.
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Canonical form used for equality and map lookups.
    pub fn canonical(&self) -> String {
        canonical(&self.display)
    }
}

fn is_windows_com(name: &str) -> bool {
    let bare = name.strip_prefix(r"\\.\").unwrap_or(name);
    let rest = match bare.get(..3) {
        Some(p) if p.eq_ignore_ascii_case("com") => &bare[3..],
        _ => return false,
    };
    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
}

fn canonical(name: &str) -> String {
    if is_windows_com(name) {
        name.to_ascii_uppercase()
    } else {
        name.to_owned()
    }
}

impl PartialEq for PortKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for PortKey {}

impl std::hash::Hash for PortKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl From<&str> for PortKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PortKey {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
#[path = "port_tests.rs"]
mod tests;
