// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command names and the membership tables used by the busy-state checks.

pub const CONNECT: &str = "connect";
pub const DISCONNECT_PORT: &str = "disconnect_port";
pub const SESSION_SETUP: &str = "session_setup";
pub const SESSION_DISCONNECT: &str = "session_disconnect";
pub const SESSION_SWITCH_FG: &str = "session_switch_fg";
pub const SESSION_INFO: &str = "session_info";
pub const SET_DEFAULT: &str = "set_default";
pub const FREE: &str = "free";

pub const STATUS: &str = "status";
pub const SHUTDOWN: &str = "shutdown";
pub const PING: &str = "ping";
pub const RESET: &str = "reset";

pub const EXEC: &str = "exec";
pub const RUN: &str = "run";
pub const RUN_STOP: &str = "run_stop";
pub const RUN_INTERACTIVE: &str = "run_interactive";

pub const REPL_ENTER: &str = "repl_enter";
pub const REPL_EXIT: &str = "repl_exit";
pub const REPL_WRITE: &str = "repl_write";
pub const REPL_READ: &str = "repl_read";

pub const LS: &str = "ls";
pub const CAT: &str = "cat";
pub const STAT: &str = "stat";
pub const IS_DIR: &str = "is_dir";
pub const MEM: &str = "mem";
pub const DF: &str = "df";

pub const RM: &str = "rm";
pub const RMDIR: &str = "rmdir";
pub const MKDIR: &str = "mkdir";
pub const CP: &str = "cp";
pub const MV: &str = "mv";
pub const TOUCH: &str = "touch";
pub const FORMAT: &str = "format";

pub const GET_FILE: &str = "get_file";
pub const GET_TO_LOCAL: &str = "get_to_local";
pub const GETDIR_TO_LOCAL: &str = "getdir_to_local";
pub const PUT_FILE: &str = "put_file";
pub const PUT_FROM_LOCAL: &str = "put_from_local";
pub const PUT_FROM_LOCAL_STREAMING: &str = "put_from_local_streaming";
pub const PUTDIR_FROM_LOCAL: &str = "putdir_from_local";
pub const PUTDIR_FROM_LOCAL_STREAMING: &str = "putdir_from_local_streaming";

/// Commands that never touch a device connection.
pub const NON_REPL: &[&str] = &[
    CONNECT,
    FREE,
    DISCONNECT_PORT,
    STATUS,
    SHUTDOWN,
    PING,
    RUN_STOP,
    SESSION_INFO,
    SESSION_SETUP,
    SESSION_DISCONNECT,
    SESSION_SWITCH_FG,
    SET_DEFAULT,
];

/// Commands that leave the connection in a persistent busy state until a
/// matching exit/stop command.
pub const PERSISTENT_BUSY: &[&str] = &[RUN_INTERACTIVE, REPL_ENTER];

/// Commands that emit `stream` envelopes before their terminal response.
pub const STREAMING: &[&str] = &[
    PUT_FROM_LOCAL_STREAMING,
    PUTDIR_FROM_LOCAL_STREAMING,
    GETDIR_TO_LOCAL,
    RUN_INTERACTIVE,
    RUN_STOP,
];

/// Friendly-REPL session commands.
pub const REPL: &[&str] = &[REPL_ENTER, REPL_EXIT, REPL_WRITE, REPL_READ];

/// The only commands accepted while a detached `run` owns the connection.
pub const DETACHED_ALLOW: &[&str] = &[
    RUN_STOP,
    RESET,
    STATUS,
    PING,
    SHUTDOWN,
    SESSION_INFO,
    SESSION_DISCONNECT,
    DISCONNECT_PORT,
    FREE,
];

pub fn is_non_repl(cmd: &str) -> bool {
    NON_REPL.contains(&cmd)
}

pub fn is_streaming(cmd: &str) -> bool {
    STREAMING.contains(&cmd)
}

pub fn is_repl(cmd: &str) -> bool {
    REPL.contains(&cmd)
}

pub fn is_detached_allowed(cmd: &str) -> bool {
    DETACHED_ALLOW.contains(&cmd)
}

#[cfg(test)]
#[path = "commands_tests.rs"]
mod tests;
