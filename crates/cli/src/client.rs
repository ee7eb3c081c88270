// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent client: framed UDP requests with retry, ack-based deadline
//! extension, and stream reassembly. Spawns the agent daemon on demand.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

use replx_agent::protocol::{
    decode_b64, decode_frame, encode_frame, Envelope, ProgressEvent, StreamData, StreamType,
    MAX_UDP_SIZE,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_millis(150);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const SPAWN_WAIT: Duration = Duration::from_secs(5);

/// Client-side failure: either a transport problem or an agent error string
/// (`"<Kind>: <detail>"`).
#[derive(Debug, Clone)]
pub struct ClientError {
    pub kind: String,
    pub message: String,
}

impl ClientError {
    fn transport(message: impl Into<String>) -> Self {
        Self { kind: "Transport".to_owned(), message: message.into() }
    }

    /// Split an agent error string into its kind prefix and body.
    pub fn from_agent(error: &str) -> Self {
        match error.split_once(": ") {
            Some((kind, body)) => Self { kind: kind.to_owned(), message: body.to_owned() },
            None => Self { kind: "Error".to_owned(), message: error.to_owned() },
        }
    }

    /// Whether the caller can reasonably retry or fix this locally.
    pub fn recoverable(&self) -> bool {
        self.kind == "Busy"
            || self.message.contains("is busy")
            || self.kind == "NotConnected"
            || self.message.contains("Not connected")
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ClientError {}

/// Buffered result of a synchronous command.
#[derive(Debug, Default)]
pub struct CommandOutput {
    pub result: Value,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Per-process client context: which agent, which session, which board.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub agent_port: u16,
    pub sid: u64,
    pub explicit_port: Option<String>,
}

pub struct AgentClient {
    socket: UdpSocket,
    agent_addr: SocketAddr,
    sid: u64,
    device_port: Option<String>,
    seq: AtomicU32,
}

impl AgentClient {
    pub async fn connect(ctx: &ClientContext) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .map_err(|e| ClientError::transport(format!("bind failed: {e}")))?;
        let agent_addr: SocketAddr = ([127, 0, 0, 1], ctx.agent_port).into();
        socket
            .connect(agent_addr)
            .await
            .map_err(|e| ClientError::transport(format!("connect failed: {e}")))?;
        Ok(Self {
            socket,
            agent_addr,
            sid: ctx.sid,
            device_port: ctx.explicit_port.clone(),
            seq: AtomicU32::new(1),
        })
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn request(&self, seq: u32, command: &str, args: Value, timeout: Duration) -> Envelope {
        Envelope::Request {
            seq,
            command: command.to_owned(),
            args,
            sid: Some(self.sid),
            port: self.device_port.clone(),
            timeout_ms: Some(timeout.as_millis() as u64),
        }
    }

    /// One-shot liveness probe.
    pub async fn ping(&self) -> bool {
        let seq = self.next_seq();
        let env = self.request(seq, "ping", Value::Null, PING_TIMEOUT);
        let Ok(frame) = encode_frame(&env) else { return false };
        if self.socket.send(&frame).await.is_err() {
            return false;
        }
        let mut buf = vec![0u8; MAX_UDP_SIZE];
        loop {
            match tokio::time::timeout(PING_TIMEOUT, self.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => match decode_frame(&buf[..len]) {
                    Ok(Envelope::Response { seq: got, .. }) if got == seq => return true,
                    _ => continue,
                },
                _ => return false,
            }
        }
    }

    /// Send a command and buffer any streams until the terminal response.
    pub async fn send_command(
        &self,
        command: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<CommandOutput, ClientError> {
        self.send_with_callbacks(command, args, timeout, &mut |_, _| {}, &mut |_| {}).await
    }

    /// Streaming variant: `on_output(stream_type, bytes)` for stdout/stderr,
    /// `on_progress(event)` for progress streams.
    pub async fn send_command_streaming(
        &self,
        command: &str,
        args: Value,
        timeout: Duration,
        on_output: &mut (dyn FnMut(StreamType, Vec<u8>) + Send),
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<CommandOutput, ClientError> {
        self.send_with_callbacks(command, args, timeout, on_output, on_progress).await
    }

    async fn send_with_callbacks(
        &self,
        command: &str,
        args: Value,
        timeout: Duration,
        on_output: &mut (dyn FnMut(StreamType, Vec<u8>) + Send),
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<CommandOutput, ClientError> {
        let seq = self.next_seq();
        let env = self.request(seq, command, args, timeout);
        let frame = encode_frame(&env).map_err(|e| ClientError::from_agent(&e.to_wire()))?;

        let mut output = CommandOutput::default();
        let mut buf = vec![0u8; MAX_UDP_SIZE];
        let mut backoff = RETRY_BACKOFF;

        for attempt in 0..RETRY_ATTEMPTS {
            self.socket
                .send(&frame)
                .await
                .map_err(|e| ClientError::transport(format!("send failed: {e}")))?;

            // Short window until the first ack; the full timeout after.
            let mut acked = false;
            let mut deadline = Instant::now() + backoff.max(PING_TIMEOUT);

            loop {
                let received =
                    match tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                        Ok(Ok(len)) => len,
                        Ok(Err(e)) => {
                            return Err(ClientError::transport(format!("recv failed: {e}")))
                        }
                        Err(_) if acked => {
                            return Err(ClientError {
                                kind: "Timeout".to_owned(),
                                message: format!("{command} did not complete in time"),
                            })
                        }
                        Err(_) => break, // no ack yet; retransmit
                    };

                match decode_frame(&buf[..received]) {
                    Ok(Envelope::Ack { seq: got }) if got == seq => {
                        acked = true;
                        // The ack extends the overall deadline by the
                        // request's declared timeout.
                        deadline = Instant::now() + timeout;
                    }
                    Ok(Envelope::Stream { seq: got, stream_type, data }) if got == seq => {
                        acked = true;
                        deadline = Instant::now() + timeout;
                        match (stream_type, data) {
                            (StreamType::Progress, StreamData::Progress(event)) => {
                                on_progress(event)
                            }
                            (kind, StreamData::Text(b64)) => {
                                let bytes = decode_b64(&b64)
                                    .map_err(|e| ClientError::from_agent(&e.to_wire()))?;
                                match kind {
                                    StreamType::Stdout => output.stdout.extend_from_slice(&bytes),
                                    StreamType::Stderr => output.stderr.extend_from_slice(&bytes),
                                    StreamType::Progress => {}
                                }
                                on_output(kind, bytes);
                            }
                            _ => {}
                        }
                    }
                    Ok(Envelope::Response { seq: got, result, error }) if got == seq => {
                        if let Some(error) = error {
                            return Err(ClientError::from_agent(&error));
                        }
                        output.result = result.unwrap_or(Value::Null);
                        return Ok(output);
                    }
                    // Stale seq or noise; keep waiting.
                    Ok(_) => {}
                    Err(e) => debug!(?e, "dropping undecodable datagram"),
                }
            }

            debug!(command, attempt, "no ack from agent, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        Err(ClientError::transport(format!(
            "agent at {} is not responding",
            self.agent_addr
        )))
    }

    /// Forward interactive keystrokes to the command running under `seq`.
    pub async fn send_input(&self, run_seq: u32, data: &[u8]) -> Result<(), ClientError> {
        let env = Envelope::input(run_seq, data, Some(self.sid), self.device_port.clone());
        let frame = encode_frame(&env).map_err(|e| ClientError::from_agent(&e.to_wire()))?;
        self.socket
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| ClientError::transport(format!("send failed: {e}")))
    }

    /// Run an interactive command: stream stdout to `on_output`, pump
    /// `input_rx` bytes to the agent as `input` envelopes.
    pub async fn run_interactive(
        &self,
        command: &str,
        args: Value,
        timeout: Duration,
        on_output: &mut (dyn FnMut(StreamType, Vec<u8>) + Send),
        mut input_rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    ) -> Result<CommandOutput, ClientError> {
        let seq = self.next_seq();
        let env = self.request(seq, command, args, timeout);
        let frame = encode_frame(&env).map_err(|e| ClientError::from_agent(&e.to_wire()))?;
        self.socket
            .send(&frame)
            .await
            .map_err(|e| ClientError::transport(format!("send failed: {e}")))?;

        let mut output = CommandOutput::default();
        let mut buf = vec![0u8; MAX_UDP_SIZE];
        let mut deadline = Instant::now() + timeout;
        let mut input_open = true;

        loop {
            tokio::select! {
                maybe_input = input_rx.recv(), if input_open => {
                    match maybe_input {
                        Some(bytes) => self.send_input(seq, &bytes).await?,
                        None => input_open = false,
                    }
                }
                received = tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)) => {
                    let len = match received {
                        Ok(Ok(len)) => len,
                        Ok(Err(e)) => return Err(ClientError::transport(format!("recv failed: {e}"))),
                        Err(_) => {
                            return Err(ClientError {
                                kind: "Timeout".to_owned(),
                                message: format!("{command} did not complete in time"),
                            })
                        }
                    };
                    match decode_frame(&buf[..len]) {
                        Ok(Envelope::Ack { seq: got }) if got == seq => {
                            deadline = Instant::now() + timeout;
                        }
                        Ok(Envelope::Stream { seq: got, stream_type, data }) if got == seq => {
                            deadline = Instant::now() + timeout;
                            if let StreamData::Text(b64) = data {
                                let bytes = decode_b64(&b64)
                                    .map_err(|e| ClientError::from_agent(&e.to_wire()))?;
                                match stream_type {
                                    StreamType::Stdout => output.stdout.extend_from_slice(&bytes),
                                    StreamType::Stderr => output.stderr.extend_from_slice(&bytes),
                                    StreamType::Progress => {}
                                }
                                on_output(stream_type, bytes);
                            }
                        }
                        Ok(Envelope::Response { seq: got, result, error }) if got == seq => {
                            if let Some(error) = error {
                                return Err(ClientError::from_agent(&error));
                            }
                            output.result = result.unwrap_or(Value::Null);
                            return Ok(output);
                        }
                        Ok(_) => {}
                        Err(e) => debug!(?e, "dropping undecodable datagram"),
                    }
                }
            }
        }
    }
}

/// Is an agent answering on this port?
pub async fn is_agent_running(agent_port: u16) -> bool {
    let ctx = ClientContext { agent_port, sid: 0, explicit_port: None };
    match AgentClient::connect(&ctx).await {
        Ok(client) => client.ping().await,
        Err(_) => false,
    }
}

/// Spawn the agent daemon detached and wait for it to answer pings.
pub async fn start_agent(agent_port: u16) -> Result<(), ClientError> {
    let binary = agent_binary();
    let mut command = std::process::Command::new(&binary);
    command
        .arg("--agent-port")
        .arg(agent_port.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    command
        .spawn()
        .map_err(|e| ClientError::transport(format!("cannot start {binary}: {e}")))?;

    let deadline = Instant::now() + SPAWN_WAIT;
    while Instant::now() < deadline {
        if is_agent_running(agent_port).await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(ClientError::transport("agent did not come up within 5s"))
}

/// Ask the agent to shut down and wait for the socket to go quiet.
pub async fn stop_agent(agent_port: u16) -> Result<(), ClientError> {
    let ctx = ClientContext { agent_port, sid: 0, explicit_port: None };
    let client = AgentClient::connect(&ctx).await?;
    let _ = client.send_command("shutdown", Value::Null, Duration::from_secs(2)).await;

    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if !is_agent_running(agent_port).await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(ClientError::transport("agent is still answering after shutdown"))
}

/// Resolve the agent binary: env override, then a sibling of this
/// executable, then `$PATH`.
fn agent_binary() -> String {
    if let Ok(path) = std::env::var("REPLX_AGENT_BIN") {
        return path;
    }
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name(if cfg!(windows) { "replx-agent.exe" } else { "replx-agent" });
        if sibling.is_file() {
            return sibling.to_string_lossy().into_owned();
        }
    }
    "replx-agent".to_owned()
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
