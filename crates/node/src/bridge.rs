use crate::store::BlockStore;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use hive_protocol::{decode_chunk, encode_chunk, PeerMessage, RetrievePurpose, REAUTH_INTERVAL};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Persistent WebSocket link to the coordinator. Authenticates on connect,
/// re-authenticates periodically as the liveness signal, and answers store
/// and retrieve commands out of the local block store.
pub struct Bridge {
    pub url: String,
    pub user_id: i64,
    pub peer_secret: String,
    pub store: Arc<BlockStore>,
}

impl Bridge {
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        info!("starting coordinator bridge to {}", self.url);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("bridge shutdown signal received");
                    break;
                }
                _ = self.connect_and_process() => {
                    warn!("coordinator connection lost; reconnecting in 5s...");
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }

        Ok(())
    }

    async fn connect_and_process(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .context("failed to connect to coordinator")?;
        info!("connected to coordinator at {}", self.url);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PeerMessage>();

        // Granted on auth_ok; confirmations and loss reports need it.
        let mut peer_id: Option<i64> = None;

        // The first tick fires immediately, doubling as the initial auth.
        let mut reauth = tokio::time::interval(REAUTH_INTERVAL);

        loop {
            tokio::select! {
                _ = reauth.tick() => {
                    let auth = PeerMessage::Auth {
                        user_id: self.user_id,
                        peer_secret: self.peer_secret.clone(),
                        free_storage: self.store.free_bytes(),
                    };
                    if let Ok(frame) = auth.to_frame() {
                        if write.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(response) = rx.recv() => {
                    if let Ok(frame) = response.to_frame() {
                        if write.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                }
                frame_opt = read.next() => {
                    let frame = match frame_opt {
                        Some(Ok(f)) => f,
                        _ => break, // connection closed or errored
                    };
                    let Message::Text(text) = frame else { continue };
                    let Ok(message) = PeerMessage::from_frame(&text) else {
                        warn!("undecodable frame from coordinator");
                        continue;
                    };

                    match message {
                        PeerMessage::AuthOk { peer_id: granted } => {
                            peer_id = Some(granted);
                            info!("authenticated with coordinator as peer {}", granted);
                        }
                        PeerMessage::StoreChunk { chunk_id, chunk_data } => {
                            let store = self.store.clone();
                            let tx_c = tx.clone();
                            tokio::task::spawn_blocking(move || {
                                if let Some(resp) =
                                    handle_store_blocking(store, peer_id, chunk_id, chunk_data)
                                {
                                    let _ = tx_c.send(resp);
                                }
                            });
                        }
                        PeerMessage::RetrieveChunk { chunk_id, request_id, purpose } => {
                            let store = self.store.clone();
                            let tx_c = tx.clone();
                            tokio::task::spawn_blocking(move || {
                                if let Some(resp) = handle_retrieve_blocking(
                                    store, peer_id, chunk_id, request_id, purpose,
                                ) {
                                    let _ = tx_c.send(resp);
                                }
                            });
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

fn handle_store_blocking(
    store: Arc<BlockStore>,
    peer_id: Option<i64>,
    chunk_id: String,
    chunk_data: String,
) -> Option<PeerMessage> {
    let data = match decode_chunk(&chunk_data) {
        Ok(data) => data,
        Err(e) => {
            error!("undecodable chunk payload for {}: {}", chunk_id, e);
            return None;
        }
    };

    match store.save_chunk(&chunk_id, &data) {
        Ok(true) => {
            debug!("stored chunk {} ({} bytes)", chunk_id, data.len());
            match peer_id {
                Some(peer_id) => Some(PeerMessage::ChunkStored { chunk_id, peer_id }),
                None => {
                    warn!("cannot confirm chunk {}: no peer id assigned yet", chunk_id);
                    None
                }
            }
        }
        Ok(false) => {
            warn!("refused chunk {}: allocated capacity exhausted", chunk_id);
            None
        }
        Err(e) => {
            error!("failed to store chunk {}: {}", chunk_id, e);
            None
        }
    }
}

fn handle_retrieve_blocking(
    store: Arc<BlockStore>,
    peer_id: Option<i64>,
    chunk_id: String,
    request_id: Option<String>,
    purpose: Option<RetrievePurpose>,
) -> Option<PeerMessage> {
    match store.load_chunk(&chunk_id) {
        Ok(Some(data)) => {
            debug!("served chunk {}", chunk_id);
            Some(PeerMessage::ChunkData {
                chunk_id,
                chunk_data: encode_chunk(&data),
                request_id,
                purpose,
            })
        }
        Ok(None) => {
            debug!("requested chunk {} not held here", chunk_id);
            peer_id.map(|peer_id| PeerMessage::ChunkMissing {
                chunk_id,
                peer_id,
                request_id,
                purpose,
            })
        }
        Err(e) => {
            error!("read error for chunk {}: {}", chunk_id, e);
            None
        }
    }
}
