// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Board identity: friendly-REPL banner parsing, core normalization, and the
//! core-keyed device/root-fs tables.

use serde::{Deserialize, Serialize};

/// Immutable board record, populated on first REPL contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    pub version: String,
    pub core: String,
    pub device: String,
    pub manufacturer: String,
    pub device_root_fs: String,
}

impl BoardInfo {
    /// Placeholder used before the banner has been read.
    pub fn unknown() -> Self {
        Self {
            version: "?".to_owned(),
            core: String::new(),
            device: "unknown".to_owned(),
            manufacturer: String::new(),
            device_root_fs: DEFAULT_ROOT_FS.to_owned(),
        }
    }
}

/// Known device-name suffixes per core. Cores not listed here still work;
/// their device falls back to the core name.
fn devices_for_core(core: &str) -> &'static [&'static str] {
    match core {
        "EFR32MG" => &["xnode"],
        "RP2350" => &["ticle", "ticle-lite", "ticle-sensor", "ticle-auto"],
        "MIMXRT1062DVJ6A" => &["teensy"],
        "ESP32C5" => &["ESP32C5"],
        "ESP32S3" => &["ESP32S3"],
        "ESP32P4" | "ESP32P4C5" | "ESP32P4C6" => &["ESP32P4"],
        _ => &[],
    }
}

/// Cores that do not run standard MicroPython (no `os.stat`, open/seek sizing).
pub fn is_std_micropython(core: &str) -> bool {
    normalize_core(core) != "EFR32MG"
}

pub const DEFAULT_ROOT_FS: &str = "/";

/// Root filesystem prefix per core. `/` for most; a small set mounts `/flash`.
pub fn root_fs_for_core(core: &str) -> &'static str {
    match normalize_core(core).as_str() {
        "EFR32MG" | "MIMXRT1062DVJ6A" => "/flash",
        _ => DEFAULT_ROOT_FS,
    }
}

/// Normalize a banner core to the canonical primary core.
///
/// - A secondary core after `/` is dropped (`ESP32P4/ESP32C6`).
/// - Wi-Fi companion variants collapse to the base core
///   (`ESP32P4C5`/`ESP32P4C6` -> `ESP32P4`).
/// - A trailing single letter after a digit is stripped (`RP2350B`).
pub fn normalize_core(core: &str) -> String {
    let core = core.split('/').next().unwrap_or(core);

    if core == "ESP32P4C5" || core == "ESP32P4C6" {
        return "ESP32P4".to_owned();
    }

    let bytes = core.as_bytes();
    if bytes.len() > 1
        && bytes[bytes.len() - 1].is_ascii_alphabetic()
        && bytes[bytes.len() - 2].is_ascii_digit()
    {
        return core[..core.len() - 1].to_owned();
    }
    core.to_owned()
}

/// Parsed `(version, core, device, manufacturer)` from a friendly-REPL banner.
///
/// `core` is the banner core variant before [`normalize_core`] collapsing
/// (e.g. `ESP32P4C6`); callers normalize for root-fs and registry lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBanner {
    pub version: String,
    pub core: String,
    pub device: String,
    pub manufacturer: String,
}

/// Parse a MicroPython friendly-REPL banner.
///
/// Grammar: `MicroPython v<ver>-<tag> on <date>; <prefix> with <core>` with a
/// composite form `; <prefix> with <wifi> module of external <core2> with <core1>`
/// for boards carrying a Wi-Fi companion chip.
pub fn parse_banner(banner: &str) -> Option<ParsedBanner> {
    let version = version_re()
        .captures(banner)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| "?".to_owned());

    if let Some(caps) = composite_re().captures(banner) {
        let mut prefix = caps[1].trim().to_owned();
        let wifi = caps[2].trim().to_owned();
        let core2 = caps[3].trim().to_ascii_uppercase();
        let core1 = caps[4].trim().to_ascii_uppercase();

        // ESP32P4 with an external C5/C6 Wi-Fi chip gets a companion-suffixed
        // core variant; any other pairing keeps the primary core.
        let core = if core1 == "ESP32P4" && (core2 == "ESP32C5" || core2 == "ESP32C6") {
            format!("ESP32P4{}", &core2[core2.len() - 2..])
        } else {
            core1.clone()
        };

        if let Some(stripped) = prefix.strip_suffix(" module") {
            prefix = stripped.trim_end().to_owned();
        }
        // The prefix often repeats the core name; drop it so the manufacturer
        // reads as the vendor alone.
        let vendor: Vec<&str> = prefix
            .split_whitespace()
            .filter(|w| !w.eq_ignore_ascii_case(&core1))
            .collect();
        let manufacturer = format!("{} with {wifi} ({core2})", vendor.join(" "));

        let device = normalize_core(&core);
        return Some(ParsedBanner { version, core, device, manufacturer: manufacturer.trim().to_owned() });
    }

    let caps = simple_re().captures(banner)?;
    let prefix = caps[1].trim().to_owned();
    let core_raw = caps[2].trim().to_ascii_uppercase();
    let core = normalize_core(&core_raw);

    let mut known: Vec<&str> = devices_for_core(&core).to_vec();
    known.sort_by_key(|d| std::cmp::Reverse(d.len()));

    let prefix_lower = prefix.to_lowercase();
    let mut device = None;
    let mut manufacturer = None;
    for candidate in &known {
        let cand_lower = candidate.to_lowercase();
        if prefix_lower.ends_with(&cand_lower) {
            device = Some((*candidate).to_owned());
            let idx = prefix_lower.rfind(&cand_lower).unwrap_or(0);
            manufacturer = Some(prefix[..idx].trim().to_owned());
            break;
        }
    }

    let (device, manufacturer) = match (device, manufacturer) {
        (Some(d), Some(m)) => (d, m),
        _ => {
            if known.len() == 1 {
                let first = prefix.split_whitespace().next().unwrap_or("Unknown");
                (known[0].to_owned(), first.to_owned())
            } else {
                (core.clone(), prefix.clone())
            }
        }
    };

    let manufacturer = collapse_manufacturer(manufacturer);
    Some(ParsedBanner { version, core, device, manufacturer })
}

fn collapse_manufacturer(mut manufacturer: String) -> String {
    if manufacturer.starts_with("Raspberry Pi") {
        return "Raspberry Pi".to_owned();
    }
    if let Some(stripped) = manufacturer.strip_suffix(" module") {
        manufacturer = stripped.trim_end().to_owned();
    }
    if manufacturer.is_empty() {
        manufacturer = "Unknown".to_owned();
    }
    manufacturer
}

fn version_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        regex::Regex::new(r"v(\d+\.\d+(?:\.\d+)?)(?:-[\w.]+)?").unwrap()
    })
}

fn composite_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        regex::Regex::new(r";\s*(.+?)\s+with\s+(.+?)\s+module\s+of\s+external\s+(\w+)\s+with\s+(\w+)")
            .unwrap()
    })
}

fn simple_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        regex::Regex::new(r";\s*(.+?)\s+with\s+(\S+)").unwrap()
    })
}

#[cfg(test)]
#[path = "board_tests.rs"]
mod tests;
