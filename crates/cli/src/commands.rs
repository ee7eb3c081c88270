// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command handlers: thin glue between the CLI surface and the agent
//! client. The core surfaces structured error kinds; rendering lives here.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};

use replx_agent::protocol::{ProgressEvent, StreamType};

use crate::client::{
    is_agent_running, start_agent, stop_agent, AgentClient, ClientContext, ClientError,
    DEFAULT_TIMEOUT,
};
use crate::config::{Cli, Command};
use crate::output::{format_bytes, print_panel, print_progress, render_error};
use crate::session_id::cached_session_id;
use crate::terminal::{spawn_stdin_pump, RawModeGuard};
use crate::workspace::{config_path_for_create, find_config, PortEntry, WorkspaceConfig};

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);
const FORMAT_TIMEOUT: Duration = Duration::from_secs(120);
const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(600);

pub struct App {
    ctx: ClientContext,
    config_path: Option<PathBuf>,
    config: WorkspaceConfig,
}

impl App {
    pub fn new(cli: &Cli) -> Self {
        let config_path = find_config();
        let config = config_path
            .as_deref()
            .and_then(|p| WorkspaceConfig::load(p).ok())
            .unwrap_or_default();
        let agent_port = cli.agent_port.unwrap_or_else(|| config.agent_port());
        Self {
            ctx: ClientContext {
                agent_port,
                sid: cached_session_id(),
                explicit_port: cli.port.clone(),
            },
            config_path,
            config,
        }
    }

    /// Run one CLI command; the return value is the process exit code.
    pub async fn run(mut self, command: Command) -> i32 {
        let result = match command {
            Command::Setup => self.setup().await,
            Command::Scan => self.scan(),
            Command::Exec { code } => self.exec(code).await,
            Command::Run { file, interactive, detach } => self.run_script(file, interactive, detach).await,
            Command::Stop => self.simple("run_stop", json!(null), DEFAULT_TIMEOUT).await,
            Command::Repl => self.repl().await,
            Command::Ls { path, recursive } => self.ls(path, recursive).await,
            Command::Cat { path } => self.cat(path).await,
            Command::Get { remote, local } => self.get(remote, local).await,
            Command::Put { local, remote } => self.put(local, remote).await,
            Command::Rm { path, recursive } => {
                let cmd = if recursive { "rmdir" } else { "rm" };
                self.simple(cmd, json!({"path": path}), DEFAULT_TIMEOUT).await
            }
            Command::Mkdir { path } => self.simple("mkdir", json!({"path": path}), DEFAULT_TIMEOUT).await,
            Command::Cp { src, dst } => {
                self.simple("cp", json!({"src": src, "dst": dst}), TRANSFER_TIMEOUT).await
            }
            Command::Mv { src, dst } => {
                self.simple("mv", json!({"src": src, "dst": dst}), TRANSFER_TIMEOUT).await
            }
            Command::Touch { path } => self.simple("touch", json!({"path": path}), DEFAULT_TIMEOUT).await,
            Command::Df => self.df().await,
            Command::Mem => self.mem().await,
            Command::Format { yes } => self.format(yes).await,
            Command::Reset => self.simple("reset", json!(null), DEFAULT_TIMEOUT).await,
            Command::Status => self.status().await,
            Command::Sessions => self.sessions().await,
            Command::Fg { port } => self.fg(port).await,
            Command::Disconnect { port } => self.disconnect(port).await,
            Command::Shutdown => self.shutdown().await,
        };
        match result {
            Ok(()) => 0,
            Err(e) => {
                render_error(&e);
                1
            }
        }
    }

    // -- connection plumbing -------------------------------------------------

    fn target_port(&self) -> Result<String, ClientError> {
        if let Some(port) = &self.ctx.explicit_port {
            return Ok(port.clone());
        }
        self.config.default_port.clone().ok_or_else(|| ClientError {
            kind: "NotConnected".to_owned(),
            message: "No default connection configured. Run 'replx --port PORT setup' first."
                .to_owned(),
        })
    }

    async fn ensure_agent(&self) -> Result<(), ClientError> {
        if is_agent_running(self.ctx.agent_port).await {
            return Ok(());
        }
        start_agent(self.ctx.agent_port).await
    }

    /// Ensure the agent is up and this session has the target port bound,
    /// foreground unless another port already holds the foreground.
    async fn ensure_connected(&mut self) -> Result<(AgentClient, String), ClientError> {
        let target = self.target_port()?;
        self.ensure_agent().await?;

        // Address the resolved target explicitly; session_setup needs the
        // port on the envelope even when it came from the workspace default.
        let mut ctx = self.ctx.clone();
        ctx.explicit_port = Some(target.clone());
        let client = AgentClient::connect(&ctx).await?;

        // Foreground policy: an explicit port that differs from the current
        // foreground joins as a background connection.
        let as_foreground = match (&self.ctx.explicit_port, self.current_foreground(&client).await) {
            (Some(explicit), Some(fg)) => explicit == &fg,
            _ => true,
        };

        let hints = self.config.entry(&target).cloned().unwrap_or_default();
        let mut args = json!({
            "as_foreground": as_foreground,
            "local_default": self.config.default_port,
        });
        if !hints.core.is_empty() {
            args["core"] = json!(hints.core);
            args["device"] = json!(hints.device);
        }

        let setup = client.send_command("session_setup", args, DEFAULT_TIMEOUT).await?;
        let result = &setup.result;
        if result["existing"] != json!(true) {
            print_panel(
                "Auto-connected",
                &format!(
                    "{target}  {}  {}  {}  {}",
                    result["version"].as_str().unwrap_or("?"),
                    result["core"].as_str().unwrap_or("?"),
                    result["device"].as_str().unwrap_or("?"),
                    result["manufacturer"].as_str().unwrap_or(""),
                ),
            );
        }
        self.record_connection(&target, result, false);
        Ok((client, target))
    }

    async fn current_foreground(&self, client: &AgentClient) -> Option<String> {
        let info = client.send_command("session_info", json!(null), DEFAULT_TIMEOUT).await.ok()?;
        let sessions = info.result["sessions"].as_array()?.clone();
        sessions
            .iter()
            .find(|s| s["sid"].as_u64() == Some(self.ctx.sid))
            .and_then(|s| s["foreground"].as_str().map(str::to_owned))
    }

    fn record_connection(&mut self, port: &str, result: &Value, set_default: bool) {
        let entry = PortEntry {
            version: result["version"].as_str().unwrap_or("?").to_owned(),
            core: result["core"].as_str().unwrap_or("").to_owned(),
            device: result["device"].as_str().unwrap_or("").to_owned(),
            manufacturer: result["manufacturer"].as_str().unwrap_or("").to_owned(),
            agent_port: self.ctx.agent_port,
        };
        self.config.upsert(port, entry, set_default);
        let path = self.config_path.clone().unwrap_or_else(config_path_for_create);
        if let Err(e) = self.config.save(&path) {
            eprintln!("warning: could not write {}: {e}", path.display());
        }
        self.config_path = Some(path);
    }

    /// Dispatch a command whose result only needs a success line.
    async fn simple(&mut self, command: &str, args: Value, timeout: Duration) -> Result<(), ClientError> {
        let (client, _) = self.ensure_connected().await?;
        client.send_command(command, args, timeout).await?;
        println!("ok");
        Ok(())
    }

    // -- commands ------------------------------------------------------------

    async fn setup(&mut self) -> Result<(), ClientError> {
        let port = match &self.ctx.explicit_port {
            Some(port) => port.clone(),
            None => first_candidate_port().ok_or_else(|| ClientError {
                kind: "NotConnected".to_owned(),
                message: "No serial ports found. Specify one with --port PORT.".to_owned(),
            })?,
        };
        self.ensure_agent().await?;

        let mut ctx = self.ctx.clone();
        ctx.explicit_port = Some(port.clone());
        let client = AgentClient::connect(&ctx).await?;
        let setup = client
            .send_command(
                "session_setup",
                json!({"as_foreground": true, "local_default": port}),
                DEFAULT_TIMEOUT,
            )
            .await?;
        client
            .send_command("set_default", json!({"port": port}), DEFAULT_TIMEOUT)
            .await?;

        self.record_connection(&port, &setup.result, true);
        print_panel(
            "Setup complete",
            &format!(
                "{port} is now the workspace default ({} {})",
                setup.result["core"].as_str().unwrap_or("?"),
                setup.result["version"].as_str().unwrap_or("?"),
            ),
        );
        Ok(())
    }

    fn scan(&self) -> Result<(), ClientError> {
        let ports = serialport::available_ports()
            .map_err(|e| ClientError { kind: "Error".to_owned(), message: e.to_string() })?;
        if ports.is_empty() {
            println!("no serial ports found");
            return Ok(());
        }
        for port in ports {
            match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    println!(
                        "{}  usb {:04x}:{:04x}  {}",
                        port.port_name,
                        usb.vid,
                        usb.pid,
                        usb.product.unwrap_or_default()
                    );
                }
                _ => println!("{}", port.port_name),
            }
        }
        Ok(())
    }

    async fn exec(&mut self, code: String) -> Result<(), ClientError> {
        let (client, _) = self.ensure_connected().await?;
        let out = client.send_command("exec", json!({"code": code}), DEFAULT_TIMEOUT).await?;
        if let Some(text) = out.result["output"].as_str() {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        Ok(())
    }

    async fn run_script(
        &mut self,
        file: PathBuf,
        interactive: bool,
        detach: bool,
    ) -> Result<(), ClientError> {
        let local = file.to_string_lossy().into_owned();
        let (client, _) = self.ensure_connected().await?;

        if detach {
            client
                .send_command("run", json!({"local": local, "detach": true}), DEFAULT_TIMEOUT)
                .await?;
            println!("started (use 'replx stop' to interrupt)");
            return Ok(());
        }

        let mut on_output = |_kind: StreamType, bytes: Vec<u8>| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(&bytes);
            let _ = stdout.flush();
        };

        if interactive {
            let _raw = RawModeGuard::new();
            let input_rx = spawn_stdin_pump();
            client
                .run_interactive(
                    "run_interactive",
                    json!({"local": local}),
                    INTERACTIVE_TIMEOUT,
                    &mut on_output,
                    input_rx,
                )
                .await?;
        } else {
            let mut on_progress = |_e: ProgressEvent| {};
            client
                .send_command_streaming(
                    "run",
                    json!({"local": local}),
                    INTERACTIVE_TIMEOUT,
                    &mut on_output,
                    &mut on_progress,
                )
                .await?;
        }
        Ok(())
    }

    async fn repl(&mut self) -> Result<(), ClientError> {
        let (client, port) = self.ensure_connected().await?;
        client.send_command("repl_enter", json!(null), DEFAULT_TIMEOUT).await?;
        println!("attached to {port} (Ctrl-C to exit)");

        let result = self.repl_loop(&client).await;
        let exit = client.send_command("repl_exit", json!(null), DEFAULT_TIMEOUT).await;
        result?;
        exit.map(|_| ())
    }

    async fn repl_loop(&self, client: &AgentClient) -> Result<(), ClientError> {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD;

        let _raw = RawModeGuard::new();
        let mut input_rx = spawn_stdin_pump();
        let mut poll = tokio::time::interval(Duration::from_millis(50));

        loop {
            tokio::select! {
                maybe_input = input_rx.recv() => {
                    let Some(bytes) = maybe_input else { return Ok(()) };
                    if bytes.contains(&0x03) {
                        return Ok(());
                    }
                    client
                        .send_command(
                            "repl_write",
                            json!({"data": b64.encode(&bytes)}),
                            DEFAULT_TIMEOUT,
                        )
                        .await?;
                }
                _ = poll.tick() => {
                    let out = client
                        .send_command("repl_read", json!({"max": 4096}), DEFAULT_TIMEOUT)
                        .await?;
                    if let Some(data) = out.result["data"].as_str() {
                        let bytes = b64.decode(data).unwrap_or_default();
                        if !bytes.is_empty() {
                            let mut stdout = std::io::stdout().lock();
                            let _ = stdout.write_all(&bytes);
                            let _ = stdout.flush();
                        }
                    }
                }
            }
        }
    }

    async fn ls(&mut self, path: Option<String>, recursive: bool) -> Result<(), ClientError> {
        let (client, _) = self.ensure_connected().await?;
        let args = json!({"path": path, "recursive": recursive});
        let out = client.send_command("ls", args, DEFAULT_TIMEOUT).await?;
        if let Some(items) = out.result["items"].as_array() {
            for item in items {
                let name = item["name"].as_str().unwrap_or("?");
                if item["is_dir"].as_bool().unwrap_or(false) {
                    println!("{name}/");
                } else {
                    println!("{name}  {}", format_bytes(item["size"].as_u64().unwrap_or(0)));
                }
            }
        }
        Ok(())
    }

    async fn cat(&mut self, path: String) -> Result<(), ClientError> {
        let (client, _) = self.ensure_connected().await?;
        let out = client.send_command("cat", json!({"path": path}), TRANSFER_TIMEOUT).await?;
        if out.result["is_binary"].as_bool().unwrap_or(false) {
            println!("(binary file, {} hex bytes)", out.result["content"].as_str().unwrap_or("").len() / 2);
        } else {
            print!("{}", out.result["content"].as_str().unwrap_or(""));
            let _ = std::io::stdout().flush();
        }
        Ok(())
    }

    async fn get(&mut self, remote: String, local: Option<PathBuf>) -> Result<(), ClientError> {
        let (client, _) = self.ensure_connected().await?;
        let local = local.unwrap_or_else(|| PathBuf::from("."));
        let is_dir = client
            .send_command("is_dir", json!({"path": remote}), DEFAULT_TIMEOUT)
            .await?
            .result["is_dir"]
            .as_bool()
            .unwrap_or(false);

        let command = if is_dir { "getdir_to_local" } else { "get_to_local" };
        let target = if is_dir {
            local.clone()
        } else {
            resolve_local_file(&local, &remote)
        };
        let args = json!({
            "remote_path": remote,
            "local_path": target.to_string_lossy(),
        });
        let mut on_output = |_k: StreamType, _b: Vec<u8>| {};
        let mut on_progress = |e: ProgressEvent| {
            print_progress(e.current, e.total, e.file.as_deref().unwrap_or(""));
        };
        let out = client
            .send_command_streaming(command, args, TRANSFER_TIMEOUT, &mut on_output, &mut on_progress)
            .await?;
        println!("downloaded {}", format_bytes(out.result["bytes"].as_u64().unwrap_or(0)));
        Ok(())
    }

    async fn put(&mut self, local: PathBuf, remote: Option<String>) -> Result<(), ClientError> {
        let (client, _) = self.ensure_connected().await?;
        let is_dir = local.is_dir();
        let remote = remote.unwrap_or_else(|| {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("/{name}")
        });

        let command = if is_dir { "putdir_from_local_streaming" } else { "put_from_local_streaming" };
        let args = json!({
            "remote_path": remote,
            "local_path": local.to_string_lossy(),
        });
        let mut on_output = |_k: StreamType, _b: Vec<u8>| {};
        let mut on_progress = |e: ProgressEvent| {
            print_progress(e.current, e.total, e.file.as_deref().unwrap_or(""));
        };
        let out = client
            .send_command_streaming(command, args, TRANSFER_TIMEOUT, &mut on_output, &mut on_progress)
            .await?;
        println!("uploaded {}", format_bytes(out.result["bytes"].as_u64().unwrap_or(0)));
        Ok(())
    }

    async fn df(&mut self) -> Result<(), ClientError> {
        let (client, _) = self.ensure_connected().await?;
        let out = client.send_command("df", json!(null), DEFAULT_TIMEOUT).await?;
        let r = &out.result;
        println!(
            "total {}  used {}  free {}  ({}%)",
            format_bytes(r["total"].as_u64().unwrap_or(0)),
            format_bytes(r["used"].as_u64().unwrap_or(0)),
            format_bytes(r["free"].as_u64().unwrap_or(0)),
            r["percent"].as_f64().unwrap_or(0.0),
        );
        Ok(())
    }

    async fn mem(&mut self) -> Result<(), ClientError> {
        let (client, _) = self.ensure_connected().await?;
        let out = client.send_command("mem", json!(null), DEFAULT_TIMEOUT).await?;
        let r = &out.result;
        println!(
            "free {}  alloc {}  total {}  ({}%)",
            format_bytes(r["free"].as_u64().unwrap_or(0)),
            format_bytes(r["alloc"].as_u64().unwrap_or(0)),
            format_bytes(r["total"].as_u64().unwrap_or(0)),
            r["percent"].as_f64().unwrap_or(0.0),
        );
        Ok(())
    }

    async fn format(&mut self, yes: bool) -> Result<(), ClientError> {
        if !yes && !confirm("This will erase every file on the board. Type 'yes' to continue: ") {
            println!("aborted");
            return Ok(());
        }
        let (client, port) = self.ensure_connected().await?;
        let out = client.send_command("format", json!(null), FORMAT_TIMEOUT).await?;
        if out.result["formatted"].as_bool() == Some(true) {
            if out.result["reconnect"].as_bool() == Some(true) {
                println!("formatted {port}; reconnect the board before the next command");
            } else {
                println!("formatted {port}");
            }
        } else {
            println!("format is not supported on this core");
        }
        Ok(())
    }

    async fn status(&mut self) -> Result<(), ClientError> {
        if !is_agent_running(self.ctx.agent_port).await {
            println!("agent: not running");
            return Ok(());
        }
        let client = AgentClient::connect(&self.ctx).await?;
        let out = client.send_command("status", json!(null), DEFAULT_TIMEOUT).await?;
        let r = &out.result;
        print_panel(
            "Status",
            &format!(
                "{}  {}  {}  {}  {}\nbusy: {}",
                r["port"].as_str().unwrap_or("?"),
                r["version"].as_str().unwrap_or("?"),
                r["core"].as_str().unwrap_or("?"),
                r["device"].as_str().unwrap_or("?"),
                r["manufacturer"].as_str().unwrap_or(""),
                r["busy"].as_str().unwrap_or("?"),
            ),
        );
        Ok(())
    }

    async fn sessions(&mut self) -> Result<(), ClientError> {
        if !is_agent_running(self.ctx.agent_port).await {
            println!("agent: not running");
            return Ok(());
        }
        let client = AgentClient::connect(&self.ctx).await?;
        let out = client.send_command("session_info", json!(null), DEFAULT_TIMEOUT).await?;
        let me = self.ctx.sid;
        if let Some(sessions) = out.result["sessions"].as_array() {
            for session in sessions {
                let sid = session["sid"].as_u64().unwrap_or(0);
                let marker = if sid == me { "*" } else { " " };
                println!(
                    "{marker} session {sid}  fg={}  bg={}",
                    session["foreground"].as_str().unwrap_or("-"),
                    session["backgrounds"]
                        .as_array()
                        .map(|a| a.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(","))
                        .unwrap_or_default(),
                );
            }
        }
        if let Some(connections) = out.result["connections"].as_array() {
            for conn in connections {
                println!(
                    "  {}  {}  {}  {}  busy={}",
                    conn["port"].as_str().unwrap_or("?"),
                    conn["version"].as_str().unwrap_or("?"),
                    conn["core"].as_str().unwrap_or("?"),
                    conn["device"].as_str().unwrap_or("?"),
                    conn["busy"].as_str().unwrap_or("?"),
                );
            }
        }
        Ok(())
    }

    async fn fg(&mut self, port: String) -> Result<(), ClientError> {
        self.ensure_agent().await?;
        let mut ctx = self.ctx.clone();
        ctx.explicit_port = Some(port.clone());
        let client = AgentClient::connect(&ctx).await?;
        client.send_command("session_switch_fg", json!(null), DEFAULT_TIMEOUT).await?;
        println!("foreground is now {port}");
        Ok(())
    }

    async fn disconnect(&mut self, port: Option<String>) -> Result<(), ClientError> {
        if !is_agent_running(self.ctx.agent_port).await {
            println!("agent: not running");
            return Ok(());
        }
        let mut ctx = self.ctx.clone();
        if port.is_some() {
            ctx.explicit_port = port;
        }
        let client = AgentClient::connect(&ctx).await?;
        let out = client.send_command("session_disconnect", json!(null), DEFAULT_TIMEOUT).await?;
        let freed = out.result["freed_port"].as_bool().unwrap_or(false);
        let port = out.result["port"].as_str().unwrap_or("?");
        if freed {
            println!("disconnected and freed {port}");
        } else {
            println!("disconnected {port}");
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ClientError> {
        if !is_agent_running(self.ctx.agent_port).await {
            println!("agent: not running");
            return Ok(());
        }
        stop_agent(self.ctx.agent_port).await?;
        println!("agent stopped");
        Ok(())
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{prompt}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    line.trim().eq_ignore_ascii_case("yes")
}

fn resolve_local_file(local: &Path, remote: &str) -> PathBuf {
    if local.is_dir() {
        let name = remote.rsplit('/').next().unwrap_or(remote);
        local.join(name)
    } else {
        local.to_path_buf()
    }
}

/// First plausible board port from a scan, skipping Bluetooth endpoints.
fn first_candidate_port() -> Option<String> {
    let ports = serialport::available_ports().ok()?;
    ports
        .iter()
        .find(|p| {
            !p.port_name.to_lowercase().contains("bluetooth")
                && matches!(p.port_type, serialport::SerialPortType::UsbPort(_))
        })
        .or_else(|| ports.first())
        .map(|p| p.port_name.clone())
}
