// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Whole-stack transfer properties: byte identity through upload/download
//! and progress streaming over the wire.

use std::sync::{Arc, Mutex};

use serde_json::json;

use replx::client::DEFAULT_TIMEOUT;
use replx_agent::protocol::{ProgressEvent, StreamType};
use replx_agent::testing::FakeBoardFactory;
use replx_specs::{client, spawn_agent, storage_board_config};

fn sample_data() -> Vec<u8> {
    let mut data: Vec<u8> = (0..30_000u32).map(|i| (i % 251) as u8).collect();
    data.extend_from_slice(b"quotes ' and \\ backslashes\r\n\x00\xff");
    data
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_then_get_is_byte_identical_over_the_wire() {
    let image = Arc::new(Mutex::new(Vec::new()));
    let factory = FakeBoardFactory::new();
    factory.add_board("COM3", storage_board_config(Arc::clone(&image)));
    let agent = spawn_agent(factory).await;
    let session = client(agent, 1, "COM3").await;
    session.send_command("session_setup", json!({}), DEFAULT_TIMEOUT).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.bin");
    let data = sample_data();
    std::fs::write(&src, &data).unwrap();

    let put = session
        .send_command(
            "put_from_local",
            json!({"local_path": src.to_string_lossy(), "remote_path": "/data.bin"}),
            DEFAULT_TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(put.result["bytes"], json!(data.len()));
    assert_eq!(*image.lock().unwrap(), data);

    let dst = dir.path().join("back.bin");
    let get = session
        .send_command(
            "get_to_local",
            json!({"remote_path": "/data.bin", "local_path": dst.to_string_lossy()}),
            DEFAULT_TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(get.result["bytes"], json!(data.len()));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streaming_put_emits_byte_accurate_progress() {
    let image = Arc::new(Mutex::new(Vec::new()));
    let factory = FakeBoardFactory::new();
    factory.add_board("COM3", storage_board_config(Arc::clone(&image)));
    let agent = spawn_agent(factory).await;
    let session = client(agent, 1, "COM3").await;
    session.send_command("session_setup", json!({}), DEFAULT_TIMEOUT).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("app.py");
    std::fs::write(&src, vec![b'x'; 12_000]).unwrap();

    let mut events: Vec<ProgressEvent> = Vec::new();
    let mut on_output = |_k: StreamType, _b: Vec<u8>| {};
    let mut on_progress = |e: ProgressEvent| events.push(e);
    session
        .send_command_streaming(
            "put_from_local_streaming",
            json!({"local_path": src.to_string_lossy(), "remote_path": "/app.py"}),
            DEFAULT_TIMEOUT,
            &mut on_output,
            &mut on_progress,
        )
        .await
        .unwrap();

    assert!(!events.is_empty(), "expected progress streams");
    let last = events.last().unwrap();
    assert_eq!(last.current, 12_000);
    assert_eq!(last.total, 12_000);
    assert_eq!(last.bytes, Some(12_000));
    assert!(events.windows(2).all(|w| w[0].current <= w[1].current), "progress must be monotonic");
    assert_eq!(image.lock().unwrap().len(), 12_000);
}
