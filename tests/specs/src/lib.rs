// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for the end-to-end specs: an in-process agent server
//! over scripted fake boards, and ready-made client contexts.

use replx::client::{AgentClient, ClientContext};
use replx_agent::testing::{FakeBoardConfig, FakeBoardFactory};

/// Spawn an agent server on an ephemeral port and return that port.
pub async fn spawn_agent(factory: FakeBoardFactory) -> u16 {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|e| panic!("bind: {e}"));
    let port = socket.local_addr().map(|a| a.port()).unwrap_or_else(|e| panic!("addr: {e}"));
    tokio::spawn(async move {
        let _ = replx_agent::server::serve(socket, Box::new(factory)).await;
    });
    port
}

/// A client bound to one session id and one device port.
pub async fn client(agent_port: u16, sid: u64, device_port: &str) -> AgentClient {
    let ctx = ClientContext {
        agent_port,
        sid,
        explicit_port: Some(device_port.to_owned()),
    };
    AgentClient::connect(&ctx).await.unwrap_or_else(|e| panic!("connect: {e}"))
}

/// Board whose exec handler emulates one on-device file, so whole-stack
/// upload/download flows can be exercised for byte identity.
pub fn storage_board_config(
    image: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
) -> FakeBoardConfig {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use replx_agent::testing::ScriptResult;

    let read_pos = AtomicUsize::new(0);
    FakeBoardConfig {
        exec: Box::new(move |payload: &[u8]| {
            let text = String::from_utf8_lossy(payload).into_owned();
            if text.contains("os.stat") {
                return ScriptResult::ok(format!("{}\r\n", image.lock().map(|i| i.len()).unwrap_or(0)));
            }
            if text.contains("ls_dir(") {
                return ScriptResult::ok("False\r\n");
            }
            if text.contains("'wb'") {
                if let Ok(mut img) = image.lock() {
                    img.clear();
                }
                read_pos.store(0, Ordering::SeqCst);
                return ScriptResult::ok("");
            }
            if text.contains("'rb'") {
                read_pos.store(0, Ordering::SeqCst);
                return ScriptResult::ok("");
            }
            if text.contains("f.write(b'") {
                let decoded = parse_write_literals(payload);
                if let Ok(mut img) = image.lock() {
                    img.extend_from_slice(&decoded);
                }
                return ScriptResult::ok("");
            }
            if text.contains("chunk = f.read(") {
                let want: usize = text
                    .split("f.read(")
                    .nth(1)
                    .and_then(|s| s.split(')').next())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let img = match image.lock() {
                    Ok(img) => img,
                    Err(_) => return ScriptResult::ok(""),
                };
                let pos = read_pos.load(Ordering::SeqCst);
                let end = (pos + want).min(img.len());
                let chunk = img[pos..end].to_vec();
                read_pos.store(end, Ordering::SeqCst);
                return ScriptResult::Output { stdout: chunk, stderr: Vec::new() };
            }
            ScriptResult::ok("")
        }),
        ..Default::default()
    }
}

/// Decode every `f.write(b'...')` literal in a snippet back into raw bytes.
pub fn parse_write_literals(payload: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(payload);
    let mut out = Vec::new();
    let mut rest = text.as_ref();
    while let Some(pos) = rest.find("f.write(b'") {
        rest = &rest[pos + "f.write(b'".len()..];
        let mut chars = rest.char_indices();
        loop {
            let Some((i, c)) = chars.next() else { return out };
            match c {
                '\'' => {
                    rest = &rest[i + 1..];
                    break;
                }
                '\\' => {
                    let Some((_, esc)) = chars.next() else { return out };
                    match esc {
                        '\\' => out.push(b'\\'),
                        '\'' => out.push(b'\''),
                        'n' => out.push(b'\n'),
                        'r' => out.push(b'\r'),
                        't' => out.push(b'\t'),
                        'x' => {
                            let h1 = chars.next().map(|(_, c)| c).unwrap_or('0');
                            let h2 = chars.next().map(|(_, c)| c).unwrap_or('0');
                            out.push(u8::from_str_radix(&format!("{h1}{h2}"), 16).unwrap_or(0));
                        }
                        _ => {}
                    }
                }
                c => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }
    out
}
