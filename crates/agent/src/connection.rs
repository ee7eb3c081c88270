// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection object: owns one transport/codec pair, the serialization
//! mutex, and the busy-state machine shared by every session using a port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::board::{self, BoardInfo};
use crate::commands;
use crate::error::{ErrorKind, ReplError, Result};
use crate::port::PortKey;
use crate::protocol::SessionId;
use crate::repl::{ExecIo, InputSource, OutputSink, RawRepl, ReadLimit};
use crate::ring::ReplRing;
use crate::transport::TransportFactory;

const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(3);
const REPL_RING_CAPACITY: usize = 64 * 1024;

/// Busy-state machine; at most one request executes on a connection at a
/// time, and persistent states restrict what else may start.
#[derive(Debug, Clone)]
pub enum BusyState {
    Idle,
    RunningCommand { cmd: String, started_at: Instant },
    ReplAttached { owner: SessionId },
    DetachedRunning,
}

impl BusyState {
    pub fn label(&self) -> String {
        match self {
            Self::Idle => "idle".to_owned(),
            Self::RunningCommand { cmd, .. } => format!("running ({cmd})"),
            Self::ReplAttached { .. } => "repl".to_owned(),
            Self::DetachedRunning => "detached".to_owned(),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

struct ReplAttachment {
    input_tx: std::sync::mpsc::Sender<Vec<u8>>,
    detach: Arc<AtomicBool>,
    done_rx: Option<tokio::sync::oneshot::Receiver<Result<()>>>,
}

struct InteractiveAttachment {
    owner: SessionId,
    input_tx: std::sync::mpsc::Sender<Vec<u8>>,
}

/// One open serial port shared by all sessions that reference it.
pub struct Connection {
    port: PortKey,
    info: BoardInfo,
    device: Arc<Mutex<RawRepl>>,
    busy: parking_lot::Mutex<BusyState>,
    repl_ring: Arc<parking_lot::Mutex<ReplRing>>,
    repl_attachment: parking_lot::Mutex<Option<ReplAttachment>>,
    interactive: parking_lot::Mutex<Option<InteractiveAttachment>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("port", &self.port).finish()
    }
}

impl Connection {
    /// Open the port, probe the friendly-REPL banner, and start the
    /// keep-alive heartbeat. `hint_core`/`hint_device` fill in when the
    /// banner cannot be parsed.
    pub async fn open(
        factory: &dyn TransportFactory,
        port: PortKey,
        hint_core: Option<String>,
        hint_device: Option<String>,
        teardown_tx: mpsc::Sender<PortKey>,
    ) -> Result<Arc<Self>> {
        let transport = factory.open(&port)?;
        let mut repl = RawRepl::new(transport);

        let info = tokio::task::spawn_blocking(move || {
            let info = probe_board(&mut repl, hint_core, hint_device);
            (repl, info)
        })
        .await
        .map_err(|e| ReplError::device(format!("probe task failed: {e}")))
        .and_then(|(mut repl, info)| {
            let info = info?;
            repl.set_core(&info.core);
            Ok((repl, info))
        });

        let (repl, info) = match info {
            Ok(pair) => pair,
            Err(e) => return Err(e),
        };

        info!(port = %port, core = %info.core, device = %info.device, "connected");

        let conn = Arc::new(Self {
            port: port.clone(),
            info,
            device: Arc::new(Mutex::new(repl)),
            busy: parking_lot::Mutex::new(BusyState::Idle),
            repl_ring: Arc::new(parking_lot::Mutex::new(ReplRing::new(REPL_RING_CAPACITY))),
            repl_attachment: parking_lot::Mutex::new(None),
            interactive: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        conn.spawn_keep_alive(teardown_tx);
        Ok(conn)
    }

    pub fn port(&self) -> &PortKey {
        &self.port
    }

    /// Board identity; populated exactly once when the connection opened.
    pub fn info(&self) -> &BoardInfo {
        &self.info
    }

    pub fn busy_state(&self) -> BusyState {
        self.busy.lock().clone()
    }

    /// Tear the connection down: stop tasks and close the transport.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(attachment) = self.repl_attachment.lock().take() {
            attachment.detach.store(true, Ordering::SeqCst);
        }
        let mut device = self.device.lock().await;
        device.transport_mut().close();
        debug!(port = %self.port, "connection closed");
    }

    fn spawn_keep_alive(self: &Arc<Self>, teardown_tx: mpsc::Sender<PortKey>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEP_ALIVE_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = conn.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                // Skip the probe while an operation owns the device; it will
                // notice a disconnect itself.
                let Ok(mut device) = conn.device.try_lock() else { continue };
                if let Err(e) = device.transport_mut().keep_alive() {
                    drop(device);
                    if e.kind == ErrorKind::Disconnected {
                        warn!(port = %conn.port, "device disconnected, tearing down");
                        let _ = teardown_tx.send(conn.port.clone()).await;
                        return;
                    }
                }
            }
        });
    }

    /// Busy-rule check and transition into `RunningCommand`, atomically.
    fn begin(&self, cmd: &str, _sid: Option<SessionId>) -> Result<()> {
        let mut busy = self.busy.lock();
        match &*busy {
            BusyState::Idle => {}
            BusyState::RunningCommand { cmd: running, .. } => {
                return Err(ReplError::busy(format!(
                    "Connection {} is busy. Another command ({running}) is currently running. Try again later.",
                    self.port
                )));
            }
            BusyState::ReplAttached { .. } => {
                return Err(ReplError::busy(format!(
                    "A REPL session is active on {}. Exit the REPL first.",
                    self.port
                )));
            }
            BusyState::DetachedRunning => {
                if !commands::is_detached_allowed(cmd) {
                    return Err(ReplError::busy(format!(
                        "Connection {} is busy. A detached script is running; stop it with run_stop.",
                        self.port
                    )));
                }
            }
        }
        *busy = BusyState::RunningCommand { cmd: cmd.to_owned(), started_at: Instant::now() };
        Ok(())
    }

    fn settle(&self, next: BusyState) {
        *self.busy.lock() = next;
    }

    /// Run a blocking device operation under the connection mutex.
    ///
    /// The owned guard moves into the blocking task, so the serial work never
    /// ties up the async runtime while invariant I1 still holds.
    pub async fn with_device<T, F>(self: &Arc<Self>, cmd: &str, sid: Option<SessionId>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RawRepl) -> Result<T> + Send + 'static,
    {
        self.begin(cmd, sid)?;
        let result = self.run_locked(f).await;
        self.settle(BusyState::Idle);
        result
    }

    async fn run_locked<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RawRepl) -> Result<T> + Send + 'static,
    {
        let mut guard = Arc::clone(&self.device).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut guard))
            .await
            .map_err(|e| ReplError::device(format!("device task failed: {e}")))?
    }

    /// Start a detached run: send the payload, return after the device ACK,
    /// and leave the connection in `DetachedRunning`.
    pub async fn run_detached(self: &Arc<Self>, sid: Option<SessionId>, payload: Vec<u8>) -> Result<()> {
        self.begin(commands::RUN, sid)?;
        let result = self
            .run_locked(move |repl| {
                repl.enter_raw(true)?;
                repl.exec(&payload, &mut ExecIo::detached()).map(|_| ())
            })
            .await;
        match result {
            Ok(()) => {
                self.settle(BusyState::DetachedRunning);
                Ok(())
            }
            Err(e) => {
                self.settle(BusyState::Idle);
                Err(e)
            }
        }
    }

    /// Interrupt a detached run and restore the idle state.
    pub async fn run_stop(self: &Arc<Self>) -> Result<()> {
        {
            let busy = self.busy.lock();
            if !matches!(*busy, BusyState::DetachedRunning) {
                return Err(ReplError::validation(format!(
                    "No detached script is running on {}",
                    self.port
                )));
            }
        }
        let result = self
            .run_locked(move |repl| {
                repl.request_interrupt();
                // Drain the interrupt trailer; tolerate quiet devices.
                let _ = repl.read_until(
                    &[crate::repl::EOF],
                    ReadLimit::Hard(Duration::from_millis(500)),
                    None,
                    None,
                );
                let _ = repl.transport_mut().read_available();
                repl.exit_raw()
            })
            .await;
        self.settle(BusyState::Idle);
        result
    }

    /// Run a payload with stdout streaming and, when `interactive`, caller
    /// keystroke injection. Only `sid` may send input envelopes while the
    /// run is active.
    pub async fn run_streaming(
        self: &Arc<Self>,
        cmd: &str,
        sid: Option<SessionId>,
        payload: Vec<u8>,
        interactive: bool,
        out_tx: mpsc::Sender<Bytes>,
    ) -> Result<Vec<u8>> {
        self.begin(cmd, sid)?;

        let input_rx = if interactive {
            let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
            *self.interactive.lock() =
                Some(InteractiveAttachment { owner: sid.unwrap_or_default(), input_tx: tx });
            Some(rx)
        } else {
            None
        };

        let result = self
            .run_locked(move |repl| {
                repl.enter_raw(true)?;
                let mut sink = ChannelSink(out_tx);
                let mut input = input_rx.map(ChannelInput);
                let mut io = ExecIo {
                    sink: Some(&mut sink),
                    input: input.as_mut().map(|i| i as &mut dyn InputSource),
                    detach: false,
                };
                let result = repl.exec(&payload, &mut io);
                let leave = repl.exit_raw();
                let out = result?;
                leave?;
                Ok(out)
            })
            .await;

        *self.interactive.lock() = None;
        self.settle(BusyState::Idle);
        result
    }

    /// Forward an `input` envelope to the interactive run owned by `sid`.
    pub fn push_input(&self, sid: Option<SessionId>, data: Vec<u8>) -> Result<()> {
        let attachment = self.interactive.lock();
        match &*attachment {
            Some(att) => {
                if sid.unwrap_or_default() != att.owner {
                    return Err(ReplError::busy(format!(
                        "Another session owns the interactive run on {}",
                        self.port
                    )));
                }
                att.input_tx
                    .send(data)
                    .map_err(|_| ReplError::validation("interactive run already finished"))
            }
            None => Err(ReplError::validation(format!(
                "No interactive command is attached on {}",
                self.port
            ))),
        }
    }

    // -- friendly REPL attachment -------------------------------------------

    /// Attach `sid` to the friendly REPL. A pump task owns the device guard
    /// for the attachment lifetime and fills the repl ring with output.
    pub async fn repl_enter(self: &Arc<Self>, sid: SessionId) -> Result<()> {
        {
            let mut busy = self.busy.lock();
            match &*busy {
                BusyState::Idle => {}
                BusyState::ReplAttached { owner } if *owner == sid => return Ok(()),
                BusyState::ReplAttached { .. } => {
                    return Err(ReplError::busy(format!(
                        "A REPL session is active on {}.",
                        self.port
                    )))
                }
                other => {
                    return Err(ReplError::busy(format!(
                        "Connection {} is busy ({}).",
                        self.port,
                        other.label()
                    )))
                }
            }
            *busy = BusyState::ReplAttached { owner: sid };
        }

        let mut guard = Arc::clone(&self.device).lock_owned().await;
        let enter = tokio::task::spawn_blocking(move || {
            let result = guard.enter_friendly();
            (guard, result)
        })
        .await
        .map_err(|e| ReplError::device(format!("repl task failed: {e}")));

        let mut guard = match enter {
            Ok((guard, Ok(()))) => guard,
            Ok((_, Err(e))) | Err(e) => {
                self.settle(BusyState::Idle);
                return Err(e);
            }
        };

        let (input_tx, input_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let detach = Arc::new(AtomicBool::new(false));
        let detach_flag = Arc::clone(&detach);
        let ring = Arc::clone(&self.repl_ring);
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || {
            let result = (|| -> Result<()> {
                loop {
                    if detach_flag.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        break;
                    }
                    // Device -> ring.
                    let data = guard.transport_mut().read_available()?;
                    if !data.is_empty() {
                        ring.lock().write(&data);
                    }
                    // Caller keystrokes -> device.
                    let mut wrote = false;
                    while let Ok(bytes) = input_rx.try_recv() {
                        guard.transport_mut().write(&bytes)?;
                        wrote = true;
                    }
                    if data.is_empty() && !wrote {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
                guard.exit_friendly()
            })();
            let _ = done_tx.send(result);
        });

        *self.repl_attachment.lock() =
            Some(ReplAttachment { input_tx, detach, done_rx: Some(done_rx) });
        Ok(())
    }

    /// Detach the friendly REPL and restore raw mode.
    pub async fn repl_exit(self: &Arc<Self>, sid: SessionId) -> Result<()> {
        self.check_repl_owner(sid)?;
        let (detach, done_rx) = {
            let mut attachment = self.repl_attachment.lock();
            match attachment.take() {
                Some(mut att) => (att.detach, att.done_rx.take()),
                None => return Err(ReplError::validation("no REPL session is attached")),
            }
        };
        detach.store(true, Ordering::SeqCst);
        let result = match done_rx {
            Some(rx) => rx.await.unwrap_or_else(|_| Ok(())),
            None => Ok(()),
        };
        self.settle(BusyState::Idle);
        result
    }

    /// Write caller keystrokes into the attached REPL.
    pub fn repl_write(&self, sid: SessionId, data: Vec<u8>) -> Result<()> {
        self.check_repl_owner(sid)?;
        let attachment = self.repl_attachment.lock();
        match &*attachment {
            Some(att) => att
                .input_tx
                .send(data)
                .map_err(|_| ReplError::validation("REPL pump is gone")),
            None => Err(ReplError::validation("no REPL session is attached")),
        }
    }

    /// Drain buffered REPL output for the attached session.
    pub fn repl_read(&self, sid: SessionId, max: usize) -> Result<Vec<u8>> {
        self.check_repl_owner(sid)?;
        Ok(self.repl_ring.lock().drain(max))
    }

    fn check_repl_owner(&self, sid: SessionId) -> Result<()> {
        let busy = self.busy.lock();
        match &*busy {
            BusyState::ReplAttached { owner } if *owner == sid => Ok(()),
            BusyState::ReplAttached { .. } => Err(ReplError::busy(format!(
                "A REPL session is active on {} and owned by another session.",
                self.port
            ))),
            _ => Err(ReplError::validation("no REPL session is attached")),
        }
    }
}

/// Interrupt the board and read its banner through the friendly prompt.
fn probe_board(
    repl: &mut RawRepl,
    hint_core: Option<String>,
    hint_device: Option<String>,
) -> Result<BoardInfo> {
    repl.write_all(&[b'\r', crate::repl::CTRL_C])?;
    std::thread::sleep(Duration::from_millis(50));
    let _ = repl.transport_mut().reset_input_buffer();
    repl.write_all(&[b'\r', crate::repl::CTRL_B])?;
    let banner_bytes = repl
        .read_until(crate::repl::FRIENDLY_PROMPT, ReadLimit::Hard(Duration::from_secs(3)), None, None)
        .unwrap_or_default();
    let banner = String::from_utf8_lossy(&banner_bytes);

    let info = match board::parse_banner(&banner) {
        Some(parsed) => {
            let core = board::normalize_core(&parsed.core);
            let device_root_fs = board::root_fs_for_core(&core).to_owned();
            BoardInfo {
                version: parsed.version,
                core,
                device: parsed.device,
                manufacturer: parsed.manufacturer,
                device_root_fs,
            }
        }
        None => {
            let core = hint_core.unwrap_or_default();
            let device_root_fs = board::root_fs_for_core(&core).to_owned();
            BoardInfo {
                version: "?".to_owned(),
                core,
                device: hint_device.unwrap_or_else(|| "unknown".to_owned()),
                manufacturer: String::new(),
                device_root_fs,
            }
        }
    };
    Ok(info)
}

struct ChannelSink(mpsc::Sender<Bytes>);

impl OutputSink for ChannelSink {
    fn write(&mut self, data: &[u8]) {
        let _ = self.0.blocking_send(Bytes::copy_from_slice(data));
    }
}

struct ChannelInput(std::sync::mpsc::Receiver<Vec<u8>>);

impl InputSource for ChannelInput {
    fn poll(&mut self) -> Option<Vec<u8>> {
        self.0.try_recv().ok()
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
