//! MCP session table
//!
//! Runs as a single actor task: registration, lookup and notification
//! fan-out are handled one request at a time. Sessions refer to tunnels by
//! id; a tunnel that wants notifications registers a bounded notice channel
//! as the session's delegate. A delegate serving an open notification stream
//! is only replaced by another stream.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Id of the tunnel (connection) that owns or receives for a session
pub type TunnelId = u64;

/// Server-to-client notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    ToolsListChanged,
}

impl Notice {
    pub fn to_jsonrpc(&self) -> Value {
        match self {
            Notice::ToolsListChanged => json!({
                "jsonrpc": "2.0",
                "method": "notifications/tools/list_changed",
            }),
        }
    }
}

/// What callers can observe about a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub owner: TunnelId,
    pub delegate: Option<TunnelId>,
    /// Whether the delegate is serving a notification stream
    pub streaming: bool,
    pub initialized: bool,
}

#[derive(Debug)]
enum SessionRequest {
    Open {
        id: Option<String>,
        owner: TunnelId,
        reply: oneshot::Sender<String>,
    },
    Register {
        id: String,
        tunnel: TunnelId,
        notices: mpsc::Sender<Notice>,
        stream: bool,
        reply: oneshot::Sender<bool>,
    },
    MarkInitialized {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Lookup {
        id: String,
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
    Remove {
        id: String,
    },
    Release {
        tunnel: TunnelId,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

struct Delegate {
    tunnel: TunnelId,
    notices: mpsc::Sender<Notice>,
    stream: bool,
}

impl Delegate {
    /// A live stream delegate on another tunnel outranks a plain registration
    fn keeps_over(&self, tunnel: TunnelId, stream: bool) -> bool {
        self.stream && !stream && self.tunnel != tunnel && !self.notices.is_closed()
    }
}

struct Session {
    owner: TunnelId,
    delegate: Option<Delegate>,
    initialized: bool,
}

/// Handle to the session actor. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    /// Return the session for `id`, creating it if unknown. Without an id a
    /// fresh one is generated.
    pub async fn open(&self, id: Option<&str>, owner: TunnelId) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionRequest::Open {
                id: id.map(str::to_owned),
                owner,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Make `tunnel` the session's notification delegate unless another
    /// tunnel is already streaming notifications for it. Returns false when
    /// the session does not exist or the stream delegate was kept.
    pub async fn register(&self, id: &str, tunnel: TunnelId, notices: mpsc::Sender<Notice>) -> bool {
        self.send_register(id, tunnel, notices, false).await
    }

    /// Make `tunnel`, which is serving a notification stream, the session's
    /// delegate. Replaces any previous delegate.
    pub async fn register_stream(&self, id: &str, tunnel: TunnelId, notices: mpsc::Sender<Notice>) -> bool {
        self.send_register(id, tunnel, notices, true).await
    }

    async fn send_register(
        &self,
        id: &str,
        tunnel: TunnelId,
        notices: mpsc::Sender<Notice>,
        stream: bool,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .sender
            .send(SessionRequest::Register {
                id: id.to_string(),
                tunnel,
                notices,
                stream,
                reply,
            })
            .await;
        sent.is_ok() && rx.await.unwrap_or(false)
    }

    pub async fn mark_initialized(&self, id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .sender
            .send(SessionRequest::MarkInitialized {
                id: id.to_string(),
                reply,
            })
            .await;
        sent.is_ok() && rx.await.unwrap_or(false)
    }

    pub async fn lookup(&self, id: &str) -> Option<SessionInfo> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionRequest::Lookup {
                id: id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn remove(&self, id: &str) {
        let _ = self
            .sender
            .send(SessionRequest::Remove { id: id.to_string() })
            .await;
    }

    /// Forget everything tied to a closed tunnel
    pub async fn release(&self, tunnel: TunnelId) {
        let _ = self.sender.send(SessionRequest::Release { tunnel }).await;
    }

    pub async fn count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(SessionRequest::Count { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The actor owning every session
pub struct SessionTable {
    sessions: HashMap<String, Session>,
}

impl SessionTable {
    /// Spawn the actor. `changes` is the tool registry's change feed.
    pub fn spawn(changes: broadcast::Receiver<u64>) -> SessionHandle {
        let (tx, rx) = mpsc::channel(64);
        let table = Self {
            sessions: HashMap::new(),
        };
        tokio::spawn(async move {
            table.run(rx, changes).await;
        });
        SessionHandle { sender: tx }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SessionRequest>,
        mut changes: broadcast::Receiver<u64>,
    ) {
        tracing::debug!("MCP session table started");
        let mut watching = true;

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                change = changes.recv(), if watching => match change {
                    Ok(revision) => self.broadcast(Notice::ToolsListChanged, revision),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.broadcast(Notice::ToolsListChanged, 0)
                    }
                    Err(broadcast::error::RecvError::Closed) => watching = false,
                },
            }
        }

        tracing::debug!("MCP session table stopped");
    }

    fn handle(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Open { id, owner, reply } => {
                let id = id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                self.sessions.entry(id.clone()).or_insert_with(|| {
                    tracing::info!(session = %id, tunnel = owner, "MCP session created");
                    Session {
                        owner,
                        delegate: None,
                        initialized: false,
                    }
                });
                let _ = reply.send(id);
            }

            SessionRequest::Register {
                id,
                tunnel,
                notices,
                stream,
                reply,
            } => {
                let taken = match self.sessions.get_mut(&id) {
                    Some(session) => match &session.delegate {
                        Some(current) if current.keeps_over(tunnel, stream) => {
                            tracing::debug!(
                                session = %id,
                                tunnel,
                                streaming = current.tunnel,
                                "keeping streaming delegate"
                            );
                            false
                        }
                        _ => {
                            session.delegate = Some(Delegate {
                                tunnel,
                                notices,
                                stream,
                            });
                            tracing::debug!(session = %id, tunnel, stream, "notification delegate registered");
                            true
                        }
                    },
                    None => false,
                };
                let _ = reply.send(taken);
            }

            SessionRequest::MarkInitialized { id, reply } => {
                let found = match self.sessions.get_mut(&id) {
                    Some(session) => {
                        session.initialized = true;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }

            SessionRequest::Lookup { id, reply } => {
                let info = self.sessions.get(&id).map(|s| SessionInfo {
                    id: id.clone(),
                    owner: s.owner,
                    delegate: s.delegate.as_ref().map(|d| d.tunnel),
                    streaming: s.delegate.as_ref().is_some_and(|d| d.stream),
                    initialized: s.initialized,
                });
                let _ = reply.send(info);
            }

            SessionRequest::Remove { id } => {
                if self.sessions.remove(&id).is_some() {
                    tracing::info!(session = %id, "MCP session closed");
                }
            }

            SessionRequest::Release { tunnel } => {
                let before = self.sessions.len();
                self.sessions.retain(|_, s| match &s.delegate {
                    Some(d) => d.tunnel != tunnel,
                    None => s.owner != tunnel,
                });
                let removed = before - self.sessions.len();
                if removed > 0 {
                    tracing::debug!(tunnel, removed, "released MCP sessions of closed tunnel");
                }
            }

            SessionRequest::Count { reply } => {
                let _ = reply.send(self.sessions.len());
            }
        }
    }

    fn broadcast(&mut self, notice: Notice, revision: u64) {
        let mut delivered = 0usize;
        for (id, session) in self.sessions.iter_mut() {
            let Some(delegate) = &session.delegate else {
                continue;
            };
            match delegate.notices.try_send(notice) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(session = %id, "notice queue full, client already has one pending");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    session.delegate = None;
                }
            }
        }
        tracing::info!(revision, delivered, "broadcast {:?}", notice);
    }
}
