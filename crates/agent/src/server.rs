// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent server: one UDP socket, a request dispatcher over the session
//! registry and connections, and per-request streaming back to the caller.
//!
//! Ordering contract: for a single `seq`, every `stream` envelope is sent
//! before the terminal `response`, because both are emitted from the one
//! task that owns the request.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::args;
use crate::commands as cmd;
use crate::config::AgentConfig;
use crate::connection::Connection;
use crate::device_fs::DeviceFs;
use crate::error::{ReplError, Result};
use crate::port::PortKey;
use crate::protocol::{
    decode_b64, decode_frame, encode_frame, DecodeError, Envelope, ProgressEvent, SessionId,
    StreamType, MAX_UDP_SIZE,
};
use crate::registry::Runtime;
use crate::repl::EOF;
use crate::transfer;
use crate::transport::TransportFactory;

/// How far above the configured port the bind search may wander.
const PORT_SEARCH_SPAN: u16 = 16;
const GC_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

/// Bind the agent socket, searching upward from the configured port.
pub async fn bind_socket(agent_port: u16) -> anyhow::Result<UdpSocket> {
    let mut last_err = None;
    for offset in 0..PORT_SEARCH_SPAN {
        let port = agent_port.saturating_add(offset);
        match UdpSocket::bind(("127.0.0.1", port)).await {
            Ok(socket) => {
                if offset > 0 {
                    info!(port, "agent port in use, bound to fallback");
                }
                return Ok(socket);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(anyhow::anyhow!(
        "no free agent port in {}..{}: {:?}",
        agent_port,
        agent_port + PORT_SEARCH_SPAN,
        last_err
    ))
}

/// Run the agent until a `shutdown` request arrives.
pub async fn run(config: AgentConfig, factory: Box<dyn TransportFactory>) -> anyhow::Result<()> {
    let socket = bind_socket(config.agent_port).await?;
    serve(socket, factory).await
}

/// Serve on an already-bound socket (tests bind to port 0).
pub async fn serve(socket: UdpSocket, factory: Box<dyn TransportFactory>) -> anyhow::Result<()> {
    let local = socket.local_addr()?;
    info!(addr = %local, "agent listening");

    let socket = Arc::new(socket);
    let runtime = Runtime::new(factory);
    spawn_session_gc(Arc::clone(&runtime));

    let mut buf = vec![0u8; MAX_UDP_SIZE];
    loop {
        let received = tokio::select! {
            _ = runtime.shutdown.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };
        let (len, peer) = match received {
            Ok(pair) => pair,
            Err(e) => {
                warn!(err = %e, "recv_from failed");
                continue;
            }
        };

        match decode_frame(&buf[..len]) {
            Ok(Envelope::Request { seq, command, args, sid, port, .. }) => {
                let runtime = Arc::clone(&runtime);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    handle_request(runtime, socket, peer, seq, command, args, sid, port).await;
                });
            }
            Ok(Envelope::Input { data, sid, port, .. }) => {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move {
                    if let Err(e) = handle_input(&runtime, sid, port, &data).await {
                        debug!(err = %e, "input envelope dropped");
                    }
                });
            }
            // Client-role envelopes are not requests; ignore them.
            Ok(_) => {}
            Err(DecodeError::TooLarge { seq }) => {
                if let Some(seq) = seq {
                    let err = ReplError::validation("payload too large");
                    send_envelope(&socket, peer, &Envelope::response_err(seq, &err)).await;
                }
            }
            Err(DecodeError::Malformed(reason)) => {
                // Protocol errors get no response at all.
                debug!(%peer, %reason, "dropping malformed datagram");
            }
        }
    }

    info!("agent shut down");
    Ok(())
}

fn spawn_session_gc(runtime: Arc<Runtime>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(GC_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = runtime.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let alive = collect_alive_pids();
            let dropped = runtime
                .gc_sessions(|sid| {
                    // Session ids outside the pid range are cwd hashes;
                    // leave those alone.
                    u32::try_from(sid).map(|pid| alive.contains(&pid)).unwrap_or(true)
                })
                .await;
            if dropped > 0 {
                debug!(dropped, "garbage-collected dead sessions");
            }
        }
    });
}

fn collect_alive_pids() -> std::collections::HashSet<u32> {
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    system.processes().keys().map(|pid| pid.as_u32()).collect()
}

async fn send_envelope(socket: &UdpSocket, peer: SocketAddr, envelope: &Envelope) {
    let frame = match encode_frame(envelope) {
        Ok(frame) => frame,
        Err(e) => {
            // Result too big for the wire; degrade to an error response.
            let fallback = Envelope::response_err(envelope.seq(), &e);
            match encode_frame(&fallback) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = socket.send_to(&frame, peer).await {
        debug!(err = %e, %peer, "send failed");
    }
}

/// Forward an `input` envelope to the interactive command attached to the
/// session's connection.
async fn handle_input(
    runtime: &Runtime,
    sid: Option<SessionId>,
    port: Option<String>,
    data: &str,
) -> Result<()> {
    let port = runtime.resolve_port(sid, port.map(PortKey::new)).await?;
    let conn = runtime.connection(&port).await?;
    conn.push_input(sid, decode_b64(data)?)
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    runtime: Arc<Runtime>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    seq: u32,
    command: String,
    args: Value,
    sid: Option<SessionId>,
    port: Option<String>,
) {
    // Commands that touch a device (or open one) get an immediate ack so
    // the client can extend its deadline; pure registry commands answer
    // fast enough to stay a single round-trip.
    let needs_ack = !cmd::is_non_repl(&command)
        || matches!(command.as_str(), cmd::SESSION_SETUP | cmd::CONNECT | cmd::RUN_STOP);
    if needs_ack {
        send_envelope(&socket, peer, &Envelope::Ack { seq }).await;
    }

    let ctx = RequestCtx {
        runtime: &runtime,
        socket: &socket,
        peer,
        seq,
        sid,
        port: port.map(PortKey::new),
    };

    let result = dispatch(&ctx, &command, &args).await;

    let envelope = match result {
        Ok(value) => Envelope::response_ok(seq, value),
        Err(e) => Envelope::response_err(seq, &e),
    };
    send_envelope(&socket, peer, &envelope).await;

    if command == cmd::SHUTDOWN {
        runtime.shutdown_all().await;
    }
}

struct RequestCtx<'a> {
    runtime: &'a Arc<Runtime>,
    socket: &'a Arc<UdpSocket>,
    peer: SocketAddr,
    seq: u32,
    sid: Option<SessionId>,
    port: Option<PortKey>,
}

impl RequestCtx<'_> {
    async fn target_port(&self) -> Result<PortKey> {
        self.runtime.resolve_port(self.sid, self.port.clone()).await
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let port = self.target_port().await?;
        self.runtime.connection(&port).await
    }

    fn require_sid(&self) -> Result<SessionId> {
        self.sid.ok_or_else(|| ReplError::validation("session id required"))
    }

    fn require_port(&self) -> Result<PortKey> {
        self.port
            .clone()
            .ok_or_else(|| ReplError::validation("port required"))
    }

    /// Spawn a forwarder that turns raw output chunks into stdout streams.
    fn stdout_forwarder(&self) -> (mpsc::Sender<bytes::Bytes>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<bytes::Bytes>(64);
        let socket = Arc::clone(self.socket);
        let peer = self.peer;
        let seq = self.seq;
        let handle = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                send_envelope(&socket, peer, &Envelope::stream_bytes(seq, StreamType::Stdout, &chunk))
                    .await;
            }
        });
        (tx, handle)
    }

    /// Spawn a forwarder for progress events.
    fn progress_forwarder(&self) -> (mpsc::Sender<ProgressEvent>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);
        let socket = Arc::clone(self.socket);
        let peer = self.peer;
        let seq = self.seq;
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                send_envelope(&socket, peer, &Envelope::stream_progress(seq, event)).await;
            }
        });
        (tx, handle)
    }
}

async fn dispatch(ctx: &RequestCtx<'_>, command: &str, raw_args: &Value) -> Result<Value> {
    match command {
        // -- lifecycle -------------------------------------------------------
        cmd::PING => Ok(json!({"pong": true})),
        cmd::STATUS => status(ctx).await,
        cmd::SHUTDOWN => Ok(json!({"shutdown": true})),
        cmd::FREE => {
            let freed = ctx.runtime.free_all().await;
            Ok(json!({"freed": freed}))
        }

        // -- session ---------------------------------------------------------
        cmd::CONNECT => {
            let port = ctx.require_port()?;
            let conn = ctx.runtime.ensure_connection(&port, None, None).await?;
            Ok(serde_json::to_value(conn.info()).unwrap_or_default())
        }
        cmd::SESSION_SETUP => {
            let parsed: args::SessionSetupArgs = args::parse(raw_args)?;
            let sid = ctx.require_sid()?;
            let port = ctx.require_port()?;
            let result = ctx
                .runtime
                .session_setup(
                    sid,
                    port,
                    parsed.as_foreground,
                    parsed.core,
                    parsed.device,
                    parsed.local_default.map(PortKey::new),
                )
                .await?;
            let mut value = serde_json::to_value(&result).unwrap_or_default();
            if let Some(obj) = value.as_object_mut() {
                obj.insert("connected".to_owned(), Value::Bool(true));
            }
            Ok(value)
        }
        cmd::SESSION_DISCONNECT | cmd::DISCONNECT_PORT => {
            let port = ctx.target_port().await?;
            let freed = ctx.runtime.session_disconnect(&port).await?;
            Ok(json!({"port": port.display(), "freed_port": freed}))
        }
        cmd::SESSION_SWITCH_FG => {
            let sid = ctx.require_sid()?;
            let port = ctx.require_port()?;
            ctx.runtime.session_switch_fg(sid, port.clone()).await?;
            Ok(json!({"foreground": port.display()}))
        }
        cmd::SESSION_INFO => {
            let (sessions, connections) = ctx.runtime.session_info().await;
            Ok(json!({"sessions": sessions, "connections": connections}))
        }
        cmd::SET_DEFAULT => {
            let parsed: args::SetDefaultArgs = args::parse(raw_args)?;
            ctx.runtime.set_default(PortKey::new(parsed.port)).await;
            Ok(json!({"ok": true}))
        }

        // -- execute ---------------------------------------------------------
        cmd::EXEC => {
            let parsed: args::ExecArgs = args::parse(raw_args)?;
            let conn = ctx.connection().await?;
            let out = conn
                .with_device(cmd::EXEC, ctx.sid, move |repl| repl.exec_snippet(&parsed.code))
                .await?;
            Ok(json!({"output": String::from_utf8_lossy(&out)}))
        }
        cmd::RUN => run_command(ctx, raw_args, false).await,
        cmd::RUN_INTERACTIVE => run_command(ctx, raw_args, true).await,
        cmd::RUN_STOP => {
            let conn = ctx.connection().await?;
            conn.run_stop().await?;
            Ok(json!({"stopped": true}))
        }
        cmd::RESET => {
            let conn = ctx.connection().await?;
            conn.with_device(cmd::RESET, ctx.sid, |repl| {
                repl.request_interrupt();
                let _ = repl.read_until(
                    &[EOF],
                    crate::repl::ReadLimit::Hard(std::time::Duration::from_millis(300)),
                    None,
                    None,
                );
                let _ = repl.transport_mut().read_available();
                repl.soft_reset()
            })
            .await?;
            Ok(json!({"reset": true}))
        }

        // -- friendly REPL ---------------------------------------------------
        cmd::REPL_ENTER => {
            let sid = ctx.require_sid()?;
            let conn = ctx.connection().await?;
            conn.repl_enter(sid).await?;
            Ok(json!({"attached": true}))
        }
        cmd::REPL_EXIT => {
            let sid = ctx.require_sid()?;
            let conn = ctx.connection().await?;
            conn.repl_exit(sid).await?;
            Ok(json!({"attached": false}))
        }
        cmd::REPL_WRITE => {
            let parsed: args::ReplWriteArgs = args::parse(raw_args)?;
            let sid = ctx.require_sid()?;
            let conn = ctx.connection().await?;
            conn.repl_write(sid, decode_b64(&parsed.data)?)?;
            Ok(json!({"ok": true}))
        }
        cmd::REPL_READ => {
            let parsed: args::ReplReadArgs = args::parse(raw_args)?;
            let sid = ctx.require_sid()?;
            let conn = ctx.connection().await?;
            let data = conn.repl_read(sid, parsed.max)?;
            Ok(json!({"data": base64_encode(&data)}))
        }

        // -- inspect ---------------------------------------------------------
        cmd::LS => {
            let parsed: args::LsArgs = args::parse(raw_args)?;
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let path = parsed.path.unwrap_or_else(|| "/".to_owned());
            let recursive = parsed.recursive;
            let items = conn
                .with_device(cmd::LS, ctx.sid, move |repl| {
                    let mut fs = DeviceFs::new(repl, &info.core, &info.device_root_fs);
                    if recursive {
                        fs.ls_recursive(&path)
                    } else {
                        fs.ls(&path)
                    }
                })
                .await?;
            Ok(json!({"items": items}))
        }
        cmd::CAT => {
            let parsed: args::PathArgs = args::parse(raw_args)?;
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let result = conn
                .with_device(cmd::CAT, ctx.sid, move |repl| {
                    DeviceFs::new(repl, &info.core, &info.device_root_fs).cat(&parsed.path)
                })
                .await?;
            Ok(serde_json::to_value(result).unwrap_or_default())
        }
        cmd::STAT => {
            let parsed: args::PathArgs = args::parse(raw_args)?;
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let size = conn
                .with_device(cmd::STAT, ctx.sid, move |repl| {
                    DeviceFs::new(repl, &info.core, &info.device_root_fs).stat(&parsed.path)
                })
                .await?;
            Ok(json!({"size": size}))
        }
        cmd::IS_DIR => {
            let parsed: args::PathArgs = args::parse(raw_args)?;
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let is_dir = conn
                .with_device(cmd::IS_DIR, ctx.sid, move |repl| {
                    DeviceFs::new(repl, &info.core, &info.device_root_fs).is_dir(&parsed.path)
                })
                .await?;
            Ok(json!({"is_dir": is_dir}))
        }
        cmd::MEM => {
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let mem = conn
                .with_device(cmd::MEM, ctx.sid, move |repl| {
                    DeviceFs::new(repl, &info.core, &info.device_root_fs).mem()
                })
                .await?;
            Ok(serde_json::to_value(mem).unwrap_or_default())
        }
        cmd::DF => {
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let df = conn
                .with_device(cmd::DF, ctx.sid, move |repl| {
                    DeviceFs::new(repl, &info.core, &info.device_root_fs).df()
                })
                .await?;
            Ok(serde_json::to_value(df).unwrap_or_default())
        }

        // -- mutate ----------------------------------------------------------
        cmd::RM | cmd::RMDIR | cmd::MKDIR | cmd::TOUCH => {
            let parsed: args::PathArgs = args::parse(raw_args)?;
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let command = command.to_owned();
            let value = conn
                .with_device(&command.clone(), ctx.sid, move |repl| {
                    let mut fs = DeviceFs::new(repl, &info.core, &info.device_root_fs);
                    match command.as_str() {
                        cmd::RM => fs.rm(&parsed.path).map(|()| json!({"removed": parsed.path})),
                        cmd::RMDIR => fs.rmdir(&parsed.path).map(|()| json!({"removed": parsed.path})),
                        cmd::MKDIR => fs.mkdir(&parsed.path).map(|made| json!({"created": made})),
                        cmd::TOUCH => fs.touch(&parsed.path).map(|()| json!({"touched": parsed.path})),
                        _ => Err(ReplError::validation("unreachable")),
                    }
                })
                .await?;
            Ok(value)
        }
        cmd::CP | cmd::MV => {
            let parsed: args::SrcDstArgs = args::parse(raw_args)?;
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let command = command.to_owned();
            let value = conn
                .with_device(&command.clone(), ctx.sid, move |repl| {
                    let mut fs = DeviceFs::new(repl, &info.core, &info.device_root_fs);
                    match command.as_str() {
                        cmd::CP => fs.cp(&parsed.src, &parsed.dst),
                        _ => fs.mv(&parsed.src, &parsed.dst),
                    }
                    .map(|()| json!({"src": parsed.src, "dst": parsed.dst}))
                })
                .await?;
            Ok(value)
        }
        cmd::FORMAT => {
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let outcome = conn
                .with_device(cmd::FORMAT, ctx.sid, move |repl| {
                    DeviceFs::new(repl, &info.core, &info.device_root_fs).format()
                })
                .await?;
            if outcome.reconnect {
                // Core-keyed recipe requires a fresh session afterwards.
                let port = ctx.target_port().await?;
                let _ = ctx.runtime.session_disconnect(&port).await;
            }
            Ok(serde_json::to_value(outcome).unwrap_or_default())
        }

        // -- transfer --------------------------------------------------------
        cmd::GET_FILE => {
            let parsed: args::GetFileArgs = args::parse(raw_args)?;
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let result = conn
                .with_device(cmd::GET_FILE, ctx.sid, move |repl| {
                    DeviceFs::new(repl, &info.core, &info.device_root_fs).cat(&parsed.path)
                })
                .await?;
            Ok(serde_json::to_value(result).unwrap_or_default())
        }
        cmd::PUT_FILE => {
            let parsed: args::PutFileArgs = args::parse(raw_args)?;
            let content = decode_b64(&parsed.content)?;
            let conn = ctx.connection().await?;
            let info = conn.info().clone();
            let written = conn
                .with_device(cmd::PUT_FILE, ctx.sid, move |repl| {
                    write_inline(repl, &info.device_root_fs, &parsed.path, &content)
                })
                .await?;
            Ok(json!({"bytes": written}))
        }
        cmd::GET_TO_LOCAL => transfer_command(ctx, cmd::GET_TO_LOCAL, raw_args, false).await,
        cmd::GETDIR_TO_LOCAL => transfer_command(ctx, cmd::GETDIR_TO_LOCAL, raw_args, true).await,
        cmd::PUT_FROM_LOCAL => transfer_command(ctx, cmd::PUT_FROM_LOCAL, raw_args, false).await,
        cmd::PUT_FROM_LOCAL_STREAMING => {
            transfer_command(ctx, cmd::PUT_FROM_LOCAL_STREAMING, raw_args, true).await
        }
        cmd::PUTDIR_FROM_LOCAL => transfer_command(ctx, cmd::PUTDIR_FROM_LOCAL, raw_args, false).await,
        cmd::PUTDIR_FROM_LOCAL_STREAMING => {
            transfer_command(ctx, cmd::PUTDIR_FROM_LOCAL_STREAMING, raw_args, true).await
        }

        other => Err(ReplError::validation(format!("unknown command: {other}"))),
    }
}

async fn status(ctx: &RequestCtx<'_>) -> Result<Value> {
    let port = ctx.target_port().await?;
    let conn = ctx.runtime.connection(&port).await?;
    let info = conn.info();
    Ok(json!({
        "connected": true,
        "port": port.display(),
        "version": info.version,
        "core": info.core,
        "device": info.device,
        "manufacturer": info.manufacturer,
        "device_root_fs": info.device_root_fs,
        "busy": conn.busy_state().label(),
    }))
}

/// `run` / `run_interactive`: detached, streamed, or streamed-with-input.
async fn run_command(ctx: &RequestCtx<'_>, raw_args: &Value, interactive: bool) -> Result<Value> {
    let parsed: args::RunArgs = args::parse(raw_args)?;
    let payload = parsed.payload()?;
    let conn = ctx.connection().await?;

    if parsed.detach && !interactive {
        conn.run_detached(ctx.sid, payload).await?;
        return Ok(json!({"detached": true}));
    }

    let interactive = interactive || parsed.interactive;
    let label = if interactive { cmd::RUN_INTERACTIVE } else { cmd::RUN };
    let (out_tx, forwarder) = ctx.stdout_forwarder();
    let result = conn.run_streaming(label, ctx.sid, payload, interactive, out_tx).await;
    // All stream envelopes are on the wire before the response goes out.
    let _ = forwarder.await;
    let out = result?;
    Ok(json!({"output": String::from_utf8_lossy(&out)}))
}

async fn transfer_command(
    ctx: &RequestCtx<'_>,
    command: &'static str,
    raw_args: &Value,
    streaming: bool,
) -> Result<Value> {
    let parsed: args::TransferArgs = args::parse(raw_args)?;
    let conn = ctx.connection().await?;
    let info = conn.info().clone();
    let remote = parsed.remote_path.clone();
    let local = PathBuf::from(&parsed.local_path);

    let (progress_tx, forwarder) = if streaming {
        let (tx, handle) = ctx.progress_forwarder();
        (Some(tx), Some(handle))
    } else {
        (None, None)
    };

    let result = conn
        .with_device(command, ctx.sid, move |repl| {
            let mut emit = progress_tx.map(|tx| {
                move |event: ProgressEvent| {
                    let _ = tx.blocking_send(event);
                }
            });
            let mut progress: Option<&mut dyn FnMut(ProgressEvent)> =
                emit.as_mut().map(|f| f as &mut dyn FnMut(ProgressEvent));
            match command {
                cmd::GET_TO_LOCAL => transfer::get_to_local(
                    repl,
                    &info.core,
                    &info.device_root_fs,
                    &remote,
                    &local,
                    progress.take(),
                ),
                cmd::GETDIR_TO_LOCAL => transfer::getdir_to_local(
                    repl,
                    &info.core,
                    &info.device_root_fs,
                    &remote,
                    &local,
                    progress.take(),
                ),
                cmd::PUT_FROM_LOCAL | cmd::PUT_FROM_LOCAL_STREAMING => transfer::put_from_local(
                    repl,
                    &info.core,
                    &info.device_root_fs,
                    &local,
                    &remote,
                    progress.take(),
                ),
                _ => transfer::putdir_from_local(
                    repl,
                    &info.core,
                    &info.device_root_fs,
                    &local,
                    &remote,
                    progress.take(),
                ),
            }
        })
        .await;

    if let Some(handle) = forwarder {
        let _ = handle.await;
    }
    let bytes = result?;
    Ok(json!({"bytes": bytes}))
}

/// Write small in-envelope content to a device file.
fn write_inline(repl: &mut crate::repl::RawRepl, root_fs: &str, path: &str, content: &[u8]) -> Result<u64> {
    use crate::device_fs::{normalize_remote_path, py_bytes_literal, py_quote, DEVICE_CHUNK};
    use crate::repl::ExecIo;

    let remote = normalize_remote_path(path, root_fs);
    repl.enter_raw(true)?;
    let result = (|| -> Result<u64> {
        repl.exec(format!("f = open({}, 'wb')\n", py_quote(&remote)).as_bytes(), &mut ExecIo::default())?;
        for chunk in content.chunks(DEVICE_CHUNK) {
            let line = format!("f.write({})\n", py_bytes_literal(chunk));
            repl.exec(line.as_bytes(), &mut ExecIo::default())?;
        }
        repl.exec(b"f.close()", &mut ExecIo::default())?;
        Ok(content.len() as u64)
    })();
    let leave = repl.exit_raw();
    let written = result?;
    leave?;
    Ok(written)
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
