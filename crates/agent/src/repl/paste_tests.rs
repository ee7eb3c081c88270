// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::repl::{ExecIo, RawRepl};
use crate::testing::{FakeBoardConfig, FakeBoardHandle, RawPasteBehavior, ScriptResult};

fn raw_ready(config: FakeBoardConfig) -> (FakeBoardHandle, RawRepl) {
    let handle = FakeBoardHandle::new(config);
    let mut repl = RawRepl::new(Box::new(handle.transport()));
    repl.enter_raw(false).unwrap();
    // Consume the pending prompt the way exec() does.
    repl.read_until(b">", ReadLimit::Hard(Duration::from_secs(1)), None, None).unwrap();
    (handle, repl)
}

#[test]
fn negotiation_reads_window_increment() {
    let (_, mut repl) = raw_ready(FakeBoardConfig {
        raw_paste: RawPasteBehavior::Supported { increment: 64 },
        ..Default::default()
    });
    let outcome = exec_raw_paste(&mut repl, b"pass").unwrap();
    assert!(outcome.is_some());
    assert_eq!(repl.window_increment(), 64);
    assert_eq!(repl.raw_paste_cached(), Some(true));
}

#[test]
fn refusal_returns_none_and_caches() {
    let (_, mut repl) = raw_ready(FakeBoardConfig {
        raw_paste: RawPasteBehavior::Refuse,
        ..Default::default()
    });
    let outcome = exec_raw_paste(&mut repl, b"pass").unwrap();
    assert!(outcome.is_none());
    assert_eq!(repl.raw_paste_cached(), Some(false));
}

#[test]
fn zero_window_is_an_error_and_caches_unsupported() {
    let (_, mut repl) = raw_ready(FakeBoardConfig {
        raw_paste: RawPasteBehavior::ZeroWindow,
        ..Default::default()
    });
    let err = exec_raw_paste(&mut repl, b"pass").unwrap_err();
    assert_eq!(err.kind, crate::error::ErrorKind::RawPasteError);
    assert_eq!(repl.raw_paste_cached(), Some(false));
}

#[test]
fn payload_smaller_than_initial_window_needs_no_grants() {
    let (handle, mut repl) = raw_ready(FakeBoardConfig {
        raw_paste: RawPasteBehavior::Supported { increment: 256 },
        exec: Box::new(|payload: &[u8]| {
            assert_eq!(payload, b"print('hi')");
            ScriptResult::ok("hi\r\n")
        }),
        ..Default::default()
    });
    let outcome = exec_raw_paste(&mut repl, b"print('hi')").unwrap().unwrap();
    assert_eq!(outcome.stdout, b"hi\r\n");
    assert!(outcome.stderr.is_empty());
    assert!(!handle.window_violation());
}

#[test]
fn stderr_channel_is_separated() {
    let (_, mut repl) = raw_ready(FakeBoardConfig {
        exec: Box::new(|_| ScriptResult::Output {
            stdout: b"partial".to_vec(),
            stderr: b"ValueError: boom\r\n".to_vec(),
        }),
        ..Default::default()
    });
    let outcome = exec_raw_paste(&mut repl, b"boom()").unwrap().unwrap();
    assert_eq!(outcome.stdout, b"partial");
    assert_eq!(outcome.stderr, b"ValueError: boom\r\n");
}

#[test]
fn second_exec_finds_rearmed_prompt() {
    let (_, mut repl) = raw_ready(FakeBoardConfig {
        exec: Box::new(|_| ScriptResult::ok("ok\r\n")),
        ..Default::default()
    });
    exec_raw_paste(&mut repl, b"print('a')").unwrap().unwrap();
    // The trailing '>' was pushed back; a full exec() cycle must succeed.
    let out = repl.exec(b"print('b')", &mut ExecIo::default()).unwrap();
    assert_eq!(out, b"ok\r\n");
}
