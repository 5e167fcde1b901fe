//! Session Transport: multiplexes every peer WebSocket onto a single hub
//! task that owns the session map and the pending-retrieval map. HTTP
//! handlers and the reconciler reach the swarm through [`SwarmCommand`];
//! connection tasks feed typed frames back through an internal event
//! channel. All session/pending mutation happens inside this one task.

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use hive_protocol::{PeerMessage, RetrievePurpose};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sqlx::SqlitePool;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::cache::OverflowCache;
use crate::models::new_hex_id;
use crate::notify::AccountNotifier;
use crate::registry;

/// Commands into the hub from the HTTP handlers and the reconciler.
#[derive(Debug)]
pub enum SwarmCommand {
    Distribute {
        chunk_id: String,
        bytes: bytes::Bytes,
    },
    CacheFill {
        chunk_id: String,
    },
    Redistribute {
        chunk_id: String,
    },
    InvalidateSessions {
        session_ids: Vec<String>,
    },
}

enum ConnEvent {
    Opened {
        session_id: String,
        tx: mpsc::UnboundedSender<PeerMessage>,
    },
    Frame {
        session_id: String,
        message: PeerMessage,
    },
    Closed {
        session_id: String,
    },
}

/// An authenticated peer session bound to a live connection.
pub(crate) struct Session {
    pub peer_id: i64,
    pub user_id: i64,
    pub tx: mpsc::UnboundedSender<PeerMessage>,
}

/// An in-flight relayed retrieval, keyed by its request id.
pub(crate) struct PendingRetrieval {
    pub chunk_id: String,
    /// Session to deliver to; `None` for cache fills.
    pub requester: Option<String>,
    pub purpose: Option<RetrievePurpose>,
}

pub struct SwarmHub {
    pub(crate) db: SqlitePool,
    pub(crate) cache: OverflowCache,
    pub(crate) notifier: AccountNotifier,
    /// session id → authenticated session. At most one per user id.
    pub(crate) sessions: HashMap<String, Session>,
    /// Every open connection, authenticated or not.
    conns: HashMap<String, mpsc::UnboundedSender<PeerMessage>>,
    by_user: HashMap<i64, String>,
    pub(crate) pending: HashMap<String, PendingRetrieval>,
    pub(crate) rng: StdRng,
}

impl SwarmHub {
    pub fn new(db: SqlitePool, cache: OverflowCache, notifier: AccountNotifier) -> Self {
        Self {
            db,
            cache,
            notifier,
            sessions: HashMap::new(),
            conns: HashMap::new(),
            by_user: HashMap::new(),
            pending: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub async fn run(
        mut self,
        listener: TcpListener,
        mut cmd_rx: mpsc::Receiver<SwarmCommand>,
    ) -> anyhow::Result<()> {
        info!("swarm transport listening on {}", listener.local_addr()?);
        let (event_tx, mut event_rx) = mpsc::channel::<ConnEvent>(256);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let session_id = new_hex_id();
                        debug!("new peer connection {} from {}", session_id, addr);
                        tokio::spawn(serve_connection(stream, session_id, event_tx.clone()));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd).await,
                Some(event) = event_rx.recv() => self.handle_event(event).await,
            }
        }
    }

    pub(crate) fn session_for_peer(&self, peer_id: i64) -> Option<&Session> {
        self.sessions.values().find(|s| s.peer_id == peer_id)
    }

    async fn handle_command(&mut self, cmd: SwarmCommand) {
        match cmd {
            SwarmCommand::Distribute { chunk_id, bytes } => self.distribute(chunk_id, bytes).await,
            SwarmCommand::CacheFill { chunk_id } => self.cache_fill(&chunk_id).await,
            SwarmCommand::Redistribute { chunk_id } => {
                self.redistribute_from_cache(&chunk_id).await
            }
            SwarmCommand::InvalidateSessions { session_ids } => {
                for session_id in session_ids {
                    if let Some(session) = self.sessions.remove(&session_id) {
                        if self.by_user.get(&session.user_id) == Some(&session_id) {
                            self.by_user.remove(&session.user_id);
                        }
                        debug!("session {} invalidated by reconciliation", session_id);
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Opened { session_id, tx } => {
                self.conns.insert(session_id, tx);
            }
            ConnEvent::Frame {
                session_id,
                message,
            } => self.handle_frame(session_id, message).await,
            ConnEvent::Closed { session_id } => self.handle_closed(session_id).await,
        }
    }

    async fn handle_frame(&mut self, session_id: String, message: PeerMessage) {
        match message {
            PeerMessage::Auth {
                user_id,
                peer_secret,
                free_storage,
            } => {
                self.handle_auth(session_id, user_id, peer_secret, free_storage as i64)
                    .await
            }
            PeerMessage::ChunkStored { chunk_id, peer_id } => {
                debug!("chunk stored confirmation: {} by peer {}", chunk_id, peer_id);
                self.on_stored(chunk_id, peer_id).await
            }
            PeerMessage::ChunkMissing {
                chunk_id,
                peer_id,
                request_id,
                ..
            } => self.on_missing(chunk_id, peer_id, request_id).await,
            PeerMessage::RequestChunk { chunk_id } => {
                debug!("chunk requested: {}", chunk_id);
                self.route(&session_id, &chunk_id).await
            }
            PeerMessage::ChunkData {
                chunk_id,
                chunk_data,
                request_id,
                purpose,
            } => {
                self.on_chunk_data(chunk_id, chunk_data, request_id, purpose)
                    .await
            }
            PeerMessage::AuthOk { .. }
            | PeerMessage::StoreChunk { .. }
            | PeerMessage::RetrieveChunk { .. }
            | PeerMessage::Unknown => {
                debug!("ignoring unexpected frame from session {}", session_id);
            }
        }
    }

    async fn handle_auth(
        &mut self,
        session_id: String,
        user_id: i64,
        peer_secret: String,
        free_storage: i64,
    ) {
        if peer_secret.is_empty() {
            return;
        }
        let now = chrono::Utc::now().timestamp();
        match registry::authenticate(
            &self.db,
            user_id,
            &peer_secret,
            free_storage,
            &session_id,
            now,
        )
        .await
        {
            Ok(Some(peer_id)) => {
                let Some(tx) = self.conns.get(&session_id) else {
                    return;
                };
                if let Some(previous) = self.by_user.insert(user_id, session_id.clone()) {
                    if previous != session_id {
                        // A new auth supersedes the old session: it stops
                        // being addressable, but its socket stays open.
                        self.sessions.remove(&previous);
                    }
                }
                self.sessions.insert(
                    session_id.clone(),
                    Session {
                        peer_id,
                        user_id,
                        tx: tx.clone(),
                    },
                );
                let _ = tx.send(PeerMessage::AuthOk { peer_id });
                info!("peer authenticated: user {} (peer {})", user_id, peer_id);
            }
            Ok(None) => warn!("peer auth failed for user {}: invalid secret", user_id),
            Err(e) => error!("peer auth error for user {}: {}", user_id, e),
        }
    }

    async fn handle_closed(&mut self, session_id: String) {
        self.conns.remove(&session_id);
        if let Some(session) = self.sessions.remove(&session_id) {
            info!("peer disconnected: user {}", session.user_id);
            if self.by_user.get(&session.user_id) == Some(&session_id) {
                self.by_user.remove(&session.user_id);
            }
            if let Err(e) = registry::mark_offline(&self.db, session.peer_id).await {
                error!("failed to mark peer {} offline: {}", session.peer_id, e);
            }
        }
    }
}

/// Per-connection task: handshake, then pump frames both ways. Inbound
/// frames go to the hub; outbound messages arrive on a per-session channel
/// so per-session ordering is preserved.
async fn serve_connection(
    stream: TcpStream,
    session_id: String,
    events: mpsc::Sender<ConnEvent>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake failed: {}", e);
            return;
        }
    };
    let (mut sink, mut frames) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<PeerMessage>();
    if events
        .send(ConnEvent::Opened {
            session_id: session_id.clone(),
            tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(frame) = message.to_frame() else {
                continue;
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => match PeerMessage::from_frame(&text) {
                Ok(message) => {
                    if events
                        .send(ConnEvent::Frame {
                            session_id: session_id.clone(),
                            message,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => warn!("bad frame from session {}: {}", session_id, e),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let _ = events.send(ConnEvent::Closed { session_id }).await;
    writer.abort();
}
