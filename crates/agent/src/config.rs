// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

/// Local agent daemon for MicroPython boards.
#[derive(Debug, Clone, Parser)]
#[command(name = "replx-agent", version, about)]
pub struct AgentConfig {
    /// UDP port to listen on; searched upward when occupied.
    #[arg(long, env = "REPLX_AGENT_PORT", default_value = "8765")]
    pub agent_port: u16,

    /// Serial baud rate for new connections.
    #[arg(long, env = "REPLX_BAUD", default_value = "115200")]
    pub baud: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "REPLX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
