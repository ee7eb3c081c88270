// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! replx-agent: persistent local daemon that owns serial ports to
//! MicroPython boards and multiplexes concurrent CLI invocations.

pub mod args;
pub mod board;
pub mod commands;
pub mod config;
pub mod connection;
pub mod device_fs;
pub mod error;
pub mod port;
pub mod protocol;
pub mod registry;
pub mod repl;
pub mod ring;
pub mod server;
pub mod testing;
pub mod transfer;
pub mod transport;

use crate::config::AgentConfig;
use crate::transport::serial::SerialFactory;

/// Run the agent until shutdown.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let factory = SerialFactory { baud: config.baud };
    server::run(config, Box::new(factory)).await
}
