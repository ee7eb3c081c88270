// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

#[test]
fn exec_args_require_code() {
    let ok: ExecArgs = parse(&json!({"code": "print(1)"})).unwrap();
    assert_eq!(ok.code, "print(1)");

    let err = parse::<ExecArgs>(&json!({})).unwrap_err();
    assert_eq!(err.kind, crate::error::ErrorKind::ValidationError);
}

#[test]
fn unknown_fields_are_rejected() {
    let err = parse::<ExecArgs>(&json!({"code": "x", "bogus": 1})).unwrap_err();
    assert_eq!(err.kind, crate::error::ErrorKind::ValidationError);
    assert!(err.detail.contains("bogus"));
}

#[test]
fn null_args_mean_empty_object() {
    let ls: LsArgs = parse(&serde_json::Value::Null).unwrap();
    assert!(ls.path.is_none());
    assert!(!ls.recursive);
}

#[test]
fn session_setup_defaults() {
    let args: SessionSetupArgs = parse(&json!({})).unwrap();
    assert!(args.as_foreground);
    assert!(args.core.is_none());
    assert!(args.local_default.is_none());
}

#[test]
fn run_args_need_exactly_one_source() {
    let both: RunArgs = parse(&json!({"code": "x", "local": "/tmp/a.py"})).unwrap();
    assert!(both.payload().is_err());

    let neither: RunArgs = parse(&json!({})).unwrap();
    assert!(neither.payload().is_err());

    let code: RunArgs = parse(&json!({"code": "print(1)"})).unwrap();
    assert_eq!(code.payload().unwrap(), b"print(1)");
}

#[test]
fn repl_read_default_max() {
    let args: ReplReadArgs = parse(&json!({})).unwrap();
    assert_eq!(args.max, 4096);
    let args: ReplReadArgs = parse(&json!({"max": 128})).unwrap();
    assert_eq!(args.max, 128);
}
