// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace configuration file (`.vscode/.replx`).
//!
//! INI-like: one `[default]` section naming the workspace default port, and
//! one section per port with its cached board identity and agent port.
//! Writes are atomic via temp-file-rename; only the client writes, both the
//! client and the agent read.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

pub const CONFIG_FILE: &str = ".replx";
pub const DEFAULT_AGENT_PORT: u16 = 8765;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortEntry {
    pub version: String,
    pub core: String,
    pub device: String,
    pub manufacturer: String,
    pub agent_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceConfig {
    pub default_port: Option<String>,
    pub ports: IndexMap<String, PortEntry>,
}

impl WorkspaceConfig {
    pub fn entry(&self, port: &str) -> Option<&PortEntry> {
        self.ports.get(port)
    }

    /// The agent port of the default connection, or the stock default.
    pub fn agent_port(&self) -> u16 {
        self.default_port
            .as_ref()
            .and_then(|p| self.ports.get(p))
            .map(|e| e.agent_port)
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_AGENT_PORT)
    }

    /// Insert or update a port section; optionally make it the default.
    pub fn upsert(&mut self, port: &str, entry: PortEntry, set_default: bool) {
        self.ports.insert(port.to_owned(), entry);
        if set_default || self.default_port.is_none() {
            self.default_port = Some(port.to_owned());
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        let mut section: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_owned();
                if name != "default" {
                    config.ports.entry(name.clone()).or_default();
                }
                section = Some(name);
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { continue };
            let (key, value) = (key.trim(), value.trim());
            match section.as_deref() {
                Some("default") => {
                    if key == "port" {
                        config.default_port = Some(value.to_owned());
                    }
                }
                Some(port) => {
                    let entry = config.ports.entry(port.to_owned()).or_default();
                    match key {
                        "version" => entry.version = value.to_owned(),
                        "core" => entry.core = value.to_owned(),
                        "device" => entry.device = value.to_owned(),
                        "manufacturer" => entry.manufacturer = value.to_owned(),
                        "agent_port" => entry.agent_port = value.parse().unwrap_or(DEFAULT_AGENT_PORT),
                        _ => {}
                    }
                }
                None => {}
            }
        }
        config
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(default) = &self.default_port {
            out.push_str("[default]\n");
            out.push_str(&format!("port = {default}\n\n"));
        }
        for (port, entry) in &self.ports {
            out.push_str(&format!("[{port}]\n"));
            out.push_str(&format!("version = {}\n", entry.version));
            out.push_str(&format!("core = {}\n", entry.core));
            out.push_str(&format!("device = {}\n", entry.device));
            out.push_str(&format!("manufacturer = {}\n", entry.manufacturer));
            out.push_str(&format!(
                "agent_port = {}\n\n",
                if entry.agent_port == 0 { DEFAULT_AGENT_PORT } else { entry.agent_port }
            ));
        }
        out
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Atomic write: temp file in the same directory, then rename. Writes
    /// are atomic individually but not serialized across writers.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{CONFIG_FILE}.tmp.{}", std::process::id()));
        std::fs::write(&tmp, self.render())?;
        std::fs::rename(&tmp, path)
    }
}

/// Walk up from `start` looking for `.vscode/.replx`.
pub fn find_config_from(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        let candidate = current.join(".vscode").join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}

/// Find the workspace config for the current directory.
pub fn find_config() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_config_from(&cwd)
}

/// Where the config should be created if it does not exist yet.
pub fn config_path_for_create() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    cwd.join(".vscode").join(CONFIG_FILE)
}

#[cfg(test)]
#[path = "workspace_tests.rs"]
mod tests;
