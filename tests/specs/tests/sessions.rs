// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end session semantics: REPL take-over, foreground switching, and
//! disconnect cascades across sessions sharing one board.

use serde_json::json;
use std::time::Duration;

use replx::client::DEFAULT_TIMEOUT;
use replx_agent::testing::{FakeBoardConfig, FakeBoardFactory, RawPasteBehavior, ScriptResult};
use replx_specs::{client, spawn_agent};

fn print_factory(ports: &[&str]) -> FakeBoardFactory {
    let factory = FakeBoardFactory::new();
    for port in ports {
        factory.add_board(
            port,
            FakeBoardConfig {
                raw_paste: RawPasteBehavior::Refuse,
                exec: Box::new(|payload: &[u8]| {
                    if payload.starts_with(b"print(") {
                        ScriptResult::ok("3\r\n")
                    } else {
                        ScriptResult::ok("")
                    }
                }),
                ..Default::default()
            },
        );
    }
    factory
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repl_takeover_blocks_until_exit() {
    let agent = spawn_agent(print_factory(&["COM3"])).await;
    let session_a = client(agent, 1, "COM3").await;
    let session_b = client(agent, 2, "COM3").await;

    session_a.send_command("session_setup", json!({}), DEFAULT_TIMEOUT).await.unwrap();
    session_b
        .send_command("session_setup", json!({"as_foreground": false}), DEFAULT_TIMEOUT)
        .await
        .unwrap();

    session_a.send_command("repl_enter", json!(null), DEFAULT_TIMEOUT).await.unwrap();

    let err = session_b
        .send_command("exec", json!({"code": "print(1)"}), DEFAULT_TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.kind, "Busy");
    assert!(err.message.contains("REPL session is active"), "{}", err.message);

    // The owner retains access.
    session_a
        .send_command("repl_write", json!({"data": "MSsxDQ=="}), DEFAULT_TIMEOUT)
        .await
        .unwrap();
    session_a.send_command("repl_read", json!({}), DEFAULT_TIMEOUT).await.unwrap();

    session_a.send_command("repl_exit", json!(null), DEFAULT_TIMEOUT).await.unwrap();

    // After exit, the next request succeeds.
    let out = session_b
        .send_command("exec", json!({"code": "print(1+2)"}), DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(out.result["output"], json!("3\r\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn foreground_switch_swaps_with_backgrounds() {
    let agent = spawn_agent(print_factory(&["COM3", "COM4"])).await;
    let com3 = client(agent, 7, "COM3").await;
    let com4 = client(agent, 7, "COM4").await;

    com3.send_command("session_setup", json!({}), DEFAULT_TIMEOUT).await.unwrap();
    com4.send_command("session_setup", json!({"as_foreground": false}), DEFAULT_TIMEOUT)
        .await
        .unwrap();

    com4.send_command("session_switch_fg", json!(null), DEFAULT_TIMEOUT).await.unwrap();

    let info = com3.send_command("session_info", json!(null), DEFAULT_TIMEOUT).await.unwrap();
    let sessions = info.result["sessions"].as_array().unwrap();
    let session = sessions.iter().find(|s| s["sid"] == json!(7)).unwrap();
    assert_eq!(session["foreground"], json!("COM4"));
    assert_eq!(session["backgrounds"], json!(["COM3"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_cascade_frees_port_for_all_sessions() {
    let agent = spawn_agent(print_factory(&["COM3"])).await;
    let session_a = client(agent, 1, "COM3").await;
    let session_b = client(agent, 2, "COM3").await;

    session_a.send_command("session_setup", json!({}), DEFAULT_TIMEOUT).await.unwrap();
    session_b
        .send_command("session_setup", json!({"as_foreground": false}), DEFAULT_TIMEOUT)
        .await
        .unwrap();

    let out = session_b
        .send_command("session_disconnect", json!(null), DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(out.result["freed_port"], json!(true));

    // Removed from both sessions and the connection is gone.
    let info = session_a.send_command("session_info", json!(null), DEFAULT_TIMEOUT).await.unwrap();
    for session in info.result["sessions"].as_array().unwrap() {
        assert_eq!(session["foreground"], serde_json::Value::Null);
        assert_eq!(session["backgrounds"], json!([]));
    }
    assert_eq!(info.result["connections"], json!([]));

    let err = session_a.send_command("status", json!(null), DEFAULT_TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind, "NotConnected");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detached_run_allows_only_the_allow_set() {
    let factory = FakeBoardFactory::new();
    factory.add_board(
        "COM3",
        FakeBoardConfig {
            exec: Box::new(|_| ScriptResult::Running { echo: false }),
            ..Default::default()
        },
    );
    let agent = spawn_agent(factory).await;
    let session = client(agent, 1, "COM3").await;

    session.send_command("session_setup", json!({}), DEFAULT_TIMEOUT).await.unwrap();
    session
        .send_command("run", json!({"code": "loop()", "detach": true}), DEFAULT_TIMEOUT)
        .await
        .unwrap();

    let err = session
        .send_command("exec", json!({"code": "print(1)"}), DEFAULT_TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.kind, "Busy");

    // status and ping stay available while detached.
    let status = session.send_command("status", json!(null), DEFAULT_TIMEOUT).await.unwrap();
    assert_eq!(status.result["busy"], json!("detached"));
    session.send_command("ping", json!(null), Duration::from_secs(2)).await.unwrap();

    session.send_command("run_stop", json!(null), DEFAULT_TIMEOUT).await.unwrap();
    let status = session.send_command("status", json!(null), DEFAULT_TIMEOUT).await.unwrap();
    assert_eq!(status.result["busy"], json!("idle"));
}
