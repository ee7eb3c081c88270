// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal raw-mode guard for interactive regions.
//!
//! A scoped resource: construct it around interactive I/O, and the saved
//! termios state is restored on drop, including on early error returns.

#[cfg(unix)]
pub struct RawModeGuard {
    saved: Option<rustix::termios::Termios>,
}

#[cfg(unix)]
impl RawModeGuard {
    /// Switch stdin to raw mode. A non-tty stdin (pipes, CI) is left alone.
    pub fn new() -> Self {
        use rustix::termios;

        let stdin = rustix::stdio::stdin();
        if !termios::isatty(stdin) {
            return Self { saved: None };
        }
        let saved = match termios::tcgetattr(stdin) {
            Ok(t) => t,
            Err(_) => return Self { saved: None },
        };
        let mut raw = saved.clone();
        raw.make_raw();
        match termios::tcsetattr(stdin, termios::OptionalActions::Now, &raw) {
            Ok(()) => Self { saved: Some(saved) },
            Err(_) => Self { saved: None },
        }
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            use rustix::termios;
            let _ = termios::tcsetattr(rustix::stdio::stdin(), termios::OptionalActions::Now, &saved);
        }
    }
}

#[cfg(not(unix))]
pub struct RawModeGuard;

#[cfg(not(unix))]
impl RawModeGuard {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RawModeGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a blocking stdin pump: raw bytes land on the returned channel
/// until stdin closes or the receiver is dropped.
pub fn spawn_stdin_pump() -> tokio::sync::mpsc::Receiver<Vec<u8>> {
    use std::io::Read;

    let (tx, rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 64];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}
