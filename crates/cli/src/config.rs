// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Manage MicroPython boards over serial from the command line.
#[derive(Debug, Parser)]
#[command(name = "replx", version, about)]
pub struct Cli {
    /// Target serial port (defaults to the workspace default).
    #[arg(long, global = true, env = "REPLX_PORT")]
    pub port: Option<String>,

    /// Agent UDP port.
    #[arg(long, global = true, env = "REPLX_AGENT_PORT")]
    pub agent_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "REPLX_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect a board and record it as the workspace default.
    Setup,
    /// List candidate serial ports.
    Scan,
    /// Execute a code snippet on the board.
    Exec {
        /// Python code to run.
        code: String,
    },
    /// Run a local script on the board.
    Run {
        /// Script path.
        file: PathBuf,
        /// Stream output and forward keystrokes.
        #[arg(short = 'e', long)]
        interactive: bool,
        /// Start the script and return immediately.
        #[arg(short, long)]
        detach: bool,
    },
    /// Stop a detached script.
    Stop,
    /// Attach to the board's friendly REPL (Ctrl-C exits).
    Repl,
    /// List files on the board.
    Ls {
        path: Option<String>,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Print a file from the board.
    Cat { path: String },
    /// Download a file or directory from the board.
    Get {
        remote: String,
        local: Option<PathBuf>,
    },
    /// Upload a file or directory to the board.
    Put {
        local: PathBuf,
        remote: Option<String>,
    },
    /// Remove a file (or directory with -r).
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a directory (with parents).
    Mkdir { path: String },
    /// Copy on the board.
    Cp { src: String, dst: String },
    /// Move/rename on the board.
    Mv { src: String, dst: String },
    /// Create an empty file on the board.
    Touch { path: String },
    /// Filesystem usage.
    Df,
    /// Heap usage.
    Mem,
    /// Format the board filesystem.
    Format {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
    /// Soft-reset the board.
    Reset,
    /// Connection status of the target port.
    Status,
    /// All sessions and connections known to the agent.
    Sessions,
    /// Promote a connected port to this session's foreground.
    Fg { port: String },
    /// Disconnect a port from every session.
    Disconnect { port: Option<String> },
    /// Stop the agent daemon.
    Shutdown,
}
