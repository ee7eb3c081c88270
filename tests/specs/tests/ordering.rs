// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serialization invariants: commands on one connection never overlap, and
//! a busy connection reports the running command.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use replx::client::DEFAULT_TIMEOUT;
use replx_agent::testing::{FakeBoardConfig, FakeBoardFactory, RawPasteBehavior, ScriptResult};
use replx_specs::{client, spawn_agent};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_execs_never_overlap_on_one_connection() {
    let intervals: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    let intervals_clone = Arc::clone(&intervals);

    let factory = FakeBoardFactory::new();
    factory.add_board(
        "COM3",
        FakeBoardConfig {
            raw_paste: RawPasteBehavior::Refuse,
            exec: Box::new(move |payload: &[u8]| {
                if payload.starts_with(b"print(") {
                    let start = Instant::now();
                    std::thread::sleep(Duration::from_millis(40));
                    intervals_clone.lock().unwrap().push((start, Instant::now()));
                }
                ScriptResult::ok("ok\r\n")
            }),
            ..Default::default()
        },
    );
    let agent = spawn_agent(factory).await;

    let setup = client(agent, 1, "COM3").await;
    setup.send_command("session_setup", json!({}), DEFAULT_TIMEOUT).await.unwrap();

    // Four sessions hammer the same port; busy rejections are retried until
    // every exec has run once.
    let mut tasks = Vec::new();
    for sid in 1..=4u64 {
        let task = tokio::spawn(async move {
            let session = client(agent, sid, "COM3").await;
            loop {
                match session
                    .send_command("exec", json!({"code": "print('x')"}), DEFAULT_TIMEOUT)
                    .await
                {
                    Ok(_) => return,
                    Err(e) if e.kind == "Busy" => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        });
        tasks.push(task);
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut spans = intervals.lock().unwrap().clone();
    assert_eq!(spans.len(), 4);
    spans.sort_by_key(|(start, _)| *start);
    for pair in spans.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "executions overlapped: {:?} then {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_error_names_the_running_command() {
    let factory = FakeBoardFactory::new();
    factory.add_board(
        "COM3",
        FakeBoardConfig {
            raw_paste: RawPasteBehavior::Refuse,
            exec_delay: Duration::from_millis(600),
            exec: Box::new(|_| ScriptResult::ok("tick\r\n")),
            ..Default::default()
        },
    );
    let agent = spawn_agent(factory).await;

    let session_a = client(agent, 1, "COM3").await;
    let session_b = client(agent, 2, "COM3").await;
    session_a.send_command("session_setup", json!({}), DEFAULT_TIMEOUT).await.unwrap();

    let runner = tokio::spawn(async move {
        session_a
            .send_command("run", json!({"code": "main()"}), DEFAULT_TIMEOUT)
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = session_b
        .send_command("exec", json!({"code": "print(1)"}), DEFAULT_TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.kind, "Busy");
    assert!(
        err.message.contains("Connection COM3 is busy. Another command (run) is currently running"),
        "{}",
        err.message
    );

    runner.await.unwrap().unwrap();
}
