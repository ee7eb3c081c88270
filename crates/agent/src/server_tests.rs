// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::time::Duration;

use serde_json::json;

use crate::testing::{FakeBoardConfig, FakeBoardFactory, ScriptResult};

async fn start_server(factory: FakeBoardFactory) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = serve(socket, Box::new(factory)).await;
    });
    addr
}

async fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

fn request(seq: u32, command: &str, args: Value, sid: Option<u64>, port: Option<&str>) -> Envelope {
    Envelope::Request {
        seq,
        command: command.to_owned(),
        args,
        sid,
        port: port.map(str::to_owned),
        timeout_ms: None,
    }
}

/// Send a request and collect every envelope until the matching response.
async fn roundtrip(socket: &UdpSocket, server: SocketAddr, env: &Envelope) -> Vec<Envelope> {
    let frame = encode_frame(env).unwrap();
    socket.send_to(&frame, server).await.unwrap();
    collect_until_response(socket, env.seq()).await
}

async fn collect_until_response(socket: &UdpSocket, seq: u32) -> Vec<Envelope> {
    let mut seen = Vec::new();
    let mut buf = vec![0u8; MAX_UDP_SIZE];
    loop {
        let received =
            tokio::time::timeout(Duration::from_secs(15), socket.recv_from(&mut buf)).await;
        let Ok(Ok((len, _))) = received else {
            panic!("no response for seq {seq}; got {seen:?}")
        };
        let envelope = decode_frame(&buf[..len]).unwrap();
        if envelope.seq() != seq {
            continue;
        }
        let is_response = matches!(envelope, Envelope::Response { .. });
        seen.push(envelope);
        if is_response {
            return seen;
        }
    }
}

fn response_result(envelopes: &[Envelope]) -> Value {
    match envelopes.last() {
        Some(Envelope::Response { result: Some(result), error: None, .. }) => result.clone(),
        other => panic!("expected ok response, got {other:?}"),
    }
}

fn response_error(envelopes: &[Envelope]) -> String {
    match envelopes.last() {
        Some(Envelope::Response { error: Some(error), .. }) => error.clone(),
        other => panic!("expected error response, got {other:?}"),
    }
}

fn print_factory() -> FakeBoardFactory {
    let factory = FakeBoardFactory::new();
    factory.add_board(
        "COM3",
        FakeBoardConfig {
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
    factory
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_answers_without_ack() {
    let server = start_server(FakeBoardFactory::new()).await;
    let socket = client_socket().await;
    let envelopes = roundtrip(&socket, server, &request(1, "ping", Value::Null, None, None)).await;
    assert_eq!(envelopes.len(), 1, "ping is a single round-trip: {envelopes:?}");
    assert_eq!(response_result(&envelopes)["pong"], json!(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exec_on_fresh_port_returns_output() {
    let server = start_server(print_factory()).await;
    let socket = client_socket().await;

    let setup = roundtrip(
        &socket,
        server,
        &request(1, "session_setup", json!({"as_foreground": true}), Some(42), Some("COM3")),
    )
    .await;
    let result = response_result(&setup);
    assert_eq!(result["connected"], json!(true));
    assert_eq!(result["core"], json!("RP2350"));

    let exec = roundtrip(
        &socket,
        server,
        &request(2, "exec", json!({"code": "print(1+2)"}), Some(42), Some("COM3")),
    )
    .await;
    assert_eq!(response_result(&exec)["output"], json!("3\r\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_get_ack_before_response() {
    let server = start_server(print_factory()).await;
    let socket = client_socket().await;
    let envelopes = roundtrip(
        &socket,
        server,
        &request(5, "session_setup", json!({}), Some(1), Some("COM3")),
    )
    .await;
    assert!(matches!(envelopes[0], Envelope::Ack { seq: 5 }), "{envelopes:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_command_is_validation_error() {
    let server = start_server(FakeBoardFactory::new()).await;
    let socket = client_socket().await;
    let envelopes =
        roundtrip(&socket, server, &request(3, "frobnicate", Value::Null, None, None)).await;
    let error = response_error(&envelopes);
    assert!(error.starts_with("ValidationError:"), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_without_connection_is_not_connected() {
    let server = start_server(FakeBoardFactory::new()).await;
    let socket = client_socket().await;
    let envelopes =
        roundtrip(&socket, server, &request(4, "status", Value::Null, Some(1), Some("COM3"))).await;
    let error = response_error(&envelopes);
    assert!(error.starts_with("NotConnected:"), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversize_payload_is_rejected_with_error() {
    let server = start_server(FakeBoardFactory::new()).await;
    let socket = client_socket().await;

    // Hand-build an oversized frame; encode_frame refuses to.
    let payload = format!(
        "{{\"seq\":9,\"type\":\"request\",\"command\":\"exec\",\"args\":{{\"code\":\"{}\"}}}}",
        "a".repeat(crate::protocol::MAX_PAYLOAD_SIZE)
    );
    let mut frame = Vec::new();
    frame.extend_from_slice(crate::protocol::MAGIC);
    frame.push(crate::protocol::VERSION);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload.as_bytes());
    socket.send_to(&frame, server).await.unwrap();

    let envelopes = collect_until_response(&socket, 9).await;
    let error = response_error(&envelopes);
    assert!(error.contains("payload too large"), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_magic_gets_no_response() {
    let server = start_server(FakeBoardFactory::new()).await;
    let socket = client_socket().await;
    socket.send_to(b"XXXX\x01\x00\x00\x00\x02{}", server).await.unwrap();

    let mut buf = [0u8; 64];
    let received = tokio::time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(received.is_err(), "malformed datagrams must be dropped silently");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streams_arrive_before_terminal_response() {
    let factory = FakeBoardFactory::new();
    factory.add_board(
        "COM3",
        FakeBoardConfig {
            raw_paste: crate::testing::RawPasteBehavior::Refuse,
            exec: Box::new(|_| ScriptResult::ok("chunk-1\r\nchunk-2\r\n")),
            ..Default::default()
        },
    );
    let server = start_server(factory).await;
    let socket = client_socket().await;

    roundtrip(&socket, server, &request(1, "connect", Value::Null, Some(7), Some("COM3"))).await;
    let envelopes = roundtrip(
        &socket,
        server,
        &request(2, "run", json!({"code": "main()"}), Some(7), Some("COM3")),
    )
    .await;

    let mut saw_stream = false;
    let mut stdout = Vec::new();
    for (index, env) in envelopes.iter().enumerate() {
        match env {
            Envelope::Ack { .. } => {}
            Envelope::Stream { stream_type: StreamType::Stdout, data, .. } => {
                saw_stream = true;
                if let crate::protocol::StreamData::Text(b64) = data {
                    stdout.extend(decode_b64(b64).unwrap());
                }
            }
            Envelope::Response { .. } => {
                assert_eq!(index, envelopes.len() - 1, "response must be last");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }
    assert!(saw_stream, "expected stdout streams: {envelopes:?}");
    assert_eq!(stdout, b"chunk-1\r\nchunk-2\r\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_connection_rejects_second_command() {
    let factory = FakeBoardFactory::new();
    factory.add_board(
        "COM3",
        FakeBoardConfig {
            exec_delay: Duration::from_millis(600),
            exec: Box::new(|_| ScriptResult::ok("done\r\n")),
            ..Default::default()
        },
    );
    let server = start_server(factory).await;

    let socket_a = client_socket().await;
    let socket_b = client_socket().await;
    roundtrip(&socket_a, server, &request(1, "connect", Value::Null, Some(1), Some("COM3"))).await;

    let frame = encode_frame(&request(2, "run", json!({"code": "work()"}), Some(1), Some("COM3")))
        .unwrap();
    socket_a.send_to(&frame, server).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let envelopes = roundtrip(
        &socket_b,
        server,
        &request(3, "exec", json!({"code": "print(1)"}), Some(2), Some("COM3")),
    )
    .await;
    let error = response_error(&envelopes);
    assert!(error.starts_with("Busy:"), "{error}");
    assert!(error.contains("is busy"), "{error}");

    // The first command still completes normally, its output streamed.
    let first = collect_until_response(&socket_a, 2).await;
    let _ = response_result(&first);
    let mut stdout = Vec::new();
    for env in &first {
        if let Envelope::Stream { data: crate::protocol::StreamData::Text(b64), .. } = env {
            stdout.extend(decode_b64(b64).unwrap());
        }
    }
    assert_eq!(stdout, b"done\r\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_stops_the_server() {
    let server = start_server(print_factory()).await;
    let socket = client_socket().await;

    let envelopes = roundtrip(&socket, server, &request(1, "shutdown", Value::Null, None, None)).await;
    assert_eq!(response_result(&envelopes)["shutdown"], json!(true));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let frame = encode_frame(&request(2, "ping", Value::Null, None, None)).unwrap();
    socket.send_to(&frame, server).await.unwrap();
    let mut buf = [0u8; 64];
    let received = tokio::time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(received.is_err(), "server must stop answering after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_disconnect_cascades_and_frees() {
    let server = start_server(print_factory()).await;
    let socket = client_socket().await;

    roundtrip(&socket, server, &request(1, "session_setup", json!({}), Some(1), Some("COM3"))).await;
    roundtrip(
        &socket,
        server,
        &request(2, "session_setup", json!({"as_foreground": false}), Some(2), Some("COM3")),
    )
    .await;

    let disc = roundtrip(
        &socket,
        server,
        &request(3, "session_disconnect", Value::Null, Some(1), Some("COM3")),
    )
    .await;
    assert_eq!(response_result(&disc)["freed_port"], json!(true));

    let status = roundtrip(&socket, server, &request(4, "status", Value::Null, Some(2), Some("COM3"))).await;
    assert!(response_error(&status).starts_with("NotConnected:"));
}
