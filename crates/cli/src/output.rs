// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plain-text rendering for the CLI. Errors become a titled panel; certain
//! kinds carry recovery guidance.

use crate::client::ClientError;

pub fn print_panel(title: &str, body: &str) {
    println!("== {title} ==");
    for line in body.lines() {
        println!("  {line}");
    }
}

pub fn render_error(err: &ClientError) {
    print_panel(&err.kind, &err.message);
    if err.kind == "Busy" || err.message.contains("is busy") {
        println!("  The board is busy; retry when the current command finishes.");
    } else if err.kind == "NotConnected" || err.message.contains("Not connected") {
        println!("  Run 'replx --port PORT setup' to connect a board first.");
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Single-line progress bar, redrawn in place.
pub fn print_progress(current: u64, total: u64, label: &str) {
    use std::io::Write;
    const WIDTH: usize = 40;
    let pct = if total == 0 { 1.0 } else { (current as f64 / total as f64).min(1.0) };
    let filled = (pct * WIDTH as f64).round() as usize;
    let bar: String =
        std::iter::repeat('#').take(filled).chain(std::iter::repeat('-').take(WIDTH - filled)).collect();
    print!("\r[{bar}] {:3.0}% {label}", pct * 100.0);
    let _ = std::io::stdout().flush();
    if current >= total {
        println!();
    }
}

#[cfg(test)]
#[path = "output_tests.rs"]
mod tests;
