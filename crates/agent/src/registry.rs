// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session registry: terminal-scoped sessions, the port→connection table,
//! and default-port resolution.
//!
//! Sessions and connections are two keyed tables; neither stores pointers
//! into the other. The registry mutex guards lookups and mutations only —
//! it is never held across transport I/O.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{ReplError, Result};
use crate::port::PortKey;
use crate::protocol::SessionId;
use crate::transport::TransportFactory;

/// One terminal-scoped logical client.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub foreground: Option<PortKey>,
    pub backgrounds: IndexSet<PortKey>,
    pub default_port: Option<PortKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub sid: SessionId,
    pub foreground: Option<String>,
    pub backgrounds: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub port: String,
    pub version: String,
    pub core: String,
    pub device: String,
    pub manufacturer: String,
    pub busy: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupResult {
    pub existing: bool,
    pub version: String,
    pub core: String,
    pub device: String,
    pub manufacturer: String,
    pub device_root_fs: String,
}

struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    connections: HashMap<String, Arc<Connection>>,
    /// Workspace default, as last reported by a client.
    default_port: Option<PortKey>,
}

/// Agent-side runtime: the registry plus the transport factory and the
/// teardown plumbing. No global state — the server owns exactly one.
pub struct Runtime {
    factory: Box<dyn TransportFactory>,
    state: Mutex<RegistryState>,
    teardown_tx: mpsc::Sender<PortKey>,
    pub shutdown: CancellationToken,
}

impl Runtime {
    /// Build a runtime and spawn the disconnect-teardown listener.
    pub fn new(factory: Box<dyn TransportFactory>) -> Arc<Self> {
        let (teardown_tx, mut teardown_rx) = mpsc::channel::<PortKey>(16);
        let runtime = Arc::new(Self {
            factory,
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                connections: HashMap::new(),
                default_port: None,
            }),
            teardown_tx,
            shutdown: CancellationToken::new(),
        });

        let rt = Arc::clone(&runtime);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rt.shutdown.cancelled() => return,
                    port = teardown_rx.recv() => {
                        let Some(port) = port else { return };
                        info!(port = %port, "removing disconnected port from all sessions");
                        let _ = rt.remove_port(&port).await;
                    }
                }
            }
        });

        runtime
    }

    /// Look up a live connection.
    pub async fn connection(&self, port: &PortKey) -> Result<Arc<Connection>> {
        let state = self.state.lock().await;
        state
            .connections
            .get(&port.canonical())
            .cloned()
            .ok_or_else(|| ReplError::not_connected(port.display()))
    }

    /// Get or create the connection for `port`, shared across sessions.
    pub async fn ensure_connection(
        &self,
        port: &PortKey,
        hint_core: Option<String>,
        hint_device: Option<String>,
    ) -> Result<Arc<Connection>> {
        {
            let state = self.state.lock().await;
            if let Some(conn) = state.connections.get(&port.canonical()) {
                return Ok(Arc::clone(conn));
            }
        }

        // Open without holding the registry mutex; serial setup is slow.
        let conn =
            Connection::open(self.factory.as_ref(), port.clone(), hint_core, hint_device, self.teardown_tx.clone())
                .await?;

        let mut state = self.state.lock().await;
        match state.connections.get(&port.canonical()) {
            // Lost a connect race; keep the established one.
            Some(existing) => {
                let winner = Arc::clone(existing);
                drop(state);
                conn.close().await;
                Ok(winner)
            }
            None => {
                state.connections.insert(port.canonical(), Arc::clone(&conn));
                Ok(conn)
            }
        }
    }

    /// Establish (or reuse) a connection and bind it into the session.
    pub async fn session_setup(
        &self,
        sid: SessionId,
        port: PortKey,
        as_foreground: bool,
        hint_core: Option<String>,
        hint_device: Option<String>,
        local_default: Option<PortKey>,
    ) -> Result<SetupResult> {
        let conn = self.ensure_connection(&port, hint_core, hint_device).await?;
        let info = conn.info().clone();

        let mut state = self.state.lock().await;
        let session = state.sessions.entry(sid).or_default();
        if let Some(default) = local_default {
            // Session-scoped hint only; the workspace default is recorded
            // via the explicit set_default command.
            session.default_port = Some(default);
        }

        let mut existing = false;
        if as_foreground {
            if session.foreground.as_ref() == Some(&port) {
                existing = true;
            } else {
                if let Some(old) = session.foreground.take() {
                    session.backgrounds.insert(old);
                }
                session.backgrounds.shift_remove(&port);
                session.foreground = Some(port);
            }
        } else if session.foreground.as_ref() == Some(&port) || session.backgrounds.contains(&port)
        {
            existing = true;
        } else {
            session.backgrounds.insert(port);
        }

        Ok(SetupResult {
            existing,
            version: info.version,
            core: info.core,
            device: info.device,
            manufacturer: info.manufacturer,
            device_root_fs: info.device_root_fs,
        })
    }

    /// Promote a port the session already references to foreground.
    pub async fn session_switch_fg(&self, sid: SessionId, port: PortKey) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&sid)
            .ok_or_else(|| ReplError::validation("unknown session"))?;

        if session.foreground.as_ref() == Some(&port) {
            return Ok(());
        }
        if !session.backgrounds.contains(&port) {
            return Err(ReplError::validation(format!(
                "{port} is not connected in this session"
            )));
        }
        session.backgrounds.shift_remove(&port);
        if let Some(old) = session.foreground.take() {
            session.backgrounds.insert(old);
        }
        session.foreground = Some(port);
        Ok(())
    }

    /// Remove `port` from every session; destroy the connection when nothing
    /// references it any more. Returns whether the port was freed.
    pub async fn session_disconnect(&self, port: &PortKey) -> Result<bool> {
        self.remove_port(port).await
    }

    async fn remove_port(&self, port: &PortKey) -> Result<bool> {
        let conn = {
            let mut state = self.state.lock().await;
            for session in state.sessions.values_mut() {
                if session.foreground.as_ref() == Some(port) {
                    session.foreground = None;
                }
                session.backgrounds.shift_remove(port);
                if session.default_port.as_ref() == Some(port) {
                    session.default_port = None;
                }
            }
            // Nothing references the port now; the connection goes with it.
            state.connections.remove(&port.canonical())
        };

        match conn {
            Some(conn) => {
                conn.close().await;
                debug!(port = %port, "connection freed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record the workspace default port reported by a client.
    pub async fn set_default(&self, port: PortKey) {
        self.state.lock().await.default_port = Some(port);
    }

    /// Resolve the target port: explicit wins, then the session foreground,
    /// then the session default, then the agent-wide default.
    pub async fn resolve_port(
        &self,
        sid: Option<SessionId>,
        explicit: Option<PortKey>,
    ) -> Result<PortKey> {
        if let Some(port) = explicit {
            return Ok(port);
        }
        let state = self.state.lock().await;
        if let Some(sid) = sid {
            if let Some(session) = state.sessions.get(&sid) {
                if let Some(fg) = &session.foreground {
                    return Ok(fg.clone());
                }
                if let Some(default) = &session.default_port {
                    return Ok(default.clone());
                }
            }
        }
        state
            .default_port
            .clone()
            .ok_or_else(|| ReplError::validation("no target port: none given and no default configured"))
    }

    /// Snapshot of every session and every live connection.
    pub async fn session_info(&self) -> (Vec<SessionSnapshot>, Vec<ConnectionSnapshot>) {
        let state = self.state.lock().await;
        let mut sessions: Vec<SessionSnapshot> = state
            .sessions
            .iter()
            .map(|(sid, s)| SessionSnapshot {
                sid: *sid,
                foreground: s.foreground.as_ref().map(|p| p.display().to_owned()),
                backgrounds: s.backgrounds.iter().map(|p| p.display().to_owned()).collect(),
            })
            .collect();
        sessions.sort_by_key(|s| s.sid);

        let mut connections: Vec<ConnectionSnapshot> = state
            .connections
            .values()
            .map(|c| {
                let info = c.info();
                ConnectionSnapshot {
                    port: c.port().display().to_owned(),
                    version: info.version.clone(),
                    core: info.core.clone(),
                    device: info.device.clone(),
                    manufacturer: info.manufacturer.clone(),
                    busy: c.busy_state().label(),
                }
            })
            .collect();
        connections.sort_by(|a, b| a.port.cmp(&b.port));
        (sessions, connections)
    }

    /// Drop sessions whose terminal process is gone. `alive` is probed for
    /// each session id; ports referenced only by dead sessions stay
    /// connected (an explicit disconnect or shutdown frees them).
    pub async fn gc_sessions(&self, alive: impl Fn(SessionId) -> bool) -> usize {
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|sid, _| alive(*sid));
        before - state.sessions.len()
    }

    /// Close every connection and forget all sessions.
    pub async fn free_all(&self) -> Vec<String> {
        let (connections, ports) = {
            let mut state = self.state.lock().await;
            state.sessions.clear();
            let ports: Vec<String> =
                state.connections.values().map(|c| c.port().display().to_owned()).collect();
            let connections: Vec<Arc<Connection>> = state.connections.drain().map(|(_, c)| c).collect();
            (connections, ports)
        };
        for conn in connections {
            conn.close().await;
        }
        ports
    }

    /// Graceful shutdown: free everything and cancel the runtime.
    pub async fn shutdown_all(&self) {
        let _ = self.free_all().await;
        self.shutdown.cancel();
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
