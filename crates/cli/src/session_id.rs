// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal-scoped session identity.
//!
//! The session id anchors foreground/background port state in the agent to
//! one terminal window: every invocation from the same shell maps to the
//! same id. Derivation is best-effort — scan ancestor processes for a known
//! shell/terminal/IDE host, fall back to the parent pid, then to a hash of
//! the working directory.

use std::sync::OnceLock;

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Process names treated as the terminal anchor, lowercased, extension
/// stripped.
const TERMINAL_NAMES: &[&str] = &[
    "bash",
    "zsh",
    "sh",
    "fish",
    "dash",
    "ksh",
    "powershell",
    "pwsh",
    "cmd",
    "windowsterminal",
    "conemu",
    "conemu64",
    "code",
    "code-insiders",
    "pycharm",
    "pycharm64",
    "idea",
    "idea64",
];

const MAX_ANCESTOR_DEPTH: usize = 10;

/// A snapshot of the process tree: pid → (parent pid, lowercase base name).
pub type ProcessTree = std::collections::HashMap<u32, (Option<u32>, String)>;

fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    lower.strip_suffix(".exe").unwrap_or(&lower).to_owned()
}

/// Walk `start`'s ancestors in `tree` and return the first known terminal
/// host pid. Pure so tests can pin fixed process trees.
pub fn find_terminal_pid(tree: &ProcessTree, start: u32) -> Option<u32> {
    let mut current = start;
    for _ in 0..MAX_ANCESTOR_DEPTH {
        let (parent, name) = tree.get(&current)?;
        if TERMINAL_NAMES.contains(&name.as_str()) {
            return Some(current);
        }
        current = (*parent)?;
    }
    None
}

fn snapshot_tree() -> ProcessTree {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .iter()
        .map(|(pid, proc_)| {
            (
                pid.as_u32(),
                (
                    proc_.parent().map(Pid::as_u32),
                    normalize_name(&proc_.name().to_string_lossy()),
                ),
            )
        })
        .collect()
}

/// FNV-1a over the working directory; the last-resort identity.
pub fn cwd_hash(cwd: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in cwd.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash % 100_000_000
}

/// Compute the session id for this process.
pub fn session_id() -> u64 {
    let tree = snapshot_tree();
    let me = std::process::id();

    if let Some(pid) = find_terminal_pid(&tree, me) {
        return u64::from(pid);
    }
    if let Some((Some(parent), _)) = tree.get(&me) {
        if *parent > 0 {
            return u64::from(*parent);
        }
    }
    let cwd = std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    cwd_hash(&cwd)
}

/// Session id, computed once per client process.
pub fn cached_session_id() -> u64 {
    static CACHE: OnceLock<u64> = OnceLock::new();
    *CACHE.get_or_init(session_id)
}

#[cfg(test)]
#[path = "session_id_tests.rs"]
mod tests;
