//! Retrieval Router: finds a source for requested chunk bytes (overflow
//! cache or a random online replica holder) and relays them back, keeping
//! requester identity across the peer hop with an explicit request id.
//!
//! Every relayed retrieval is correlated strictly by its request id;
//! responses whose id matches no pending entry are dropped.

use hive_protocol::{decode_chunk, encode_chunk, PeerMessage, RetrievePurpose};
use rand::seq::{IteratorRandom, SliceRandom};
use tracing::{debug, error, info, warn};

use crate::ledger;
use crate::models::new_hex_id;
use crate::swarm::{PendingRetrieval, SwarmHub};

impl SwarmHub {
    /// Route a consumer's request for chunk bytes: serve from the overflow
    /// cache when possible, otherwise relay through a random online holder.
    /// With no source available the request fails here; retry is the
    /// caller's responsibility.
    pub(crate) async fn route(&mut self, requester_session: &str, chunk_id: &str) {
        match self.cache.get(chunk_id).await {
            Ok(Some(bytes)) => {
                if let Some(session) = self.sessions.get(requester_session) {
                    let _ = session.tx.send(PeerMessage::ChunkData {
                        chunk_id: chunk_id.to_string(),
                        chunk_data: encode_chunk(&bytes),
                        request_id: None,
                        purpose: None,
                    });
                    debug!("served chunk {} from cache", chunk_id);
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!("cache lookup failed for chunk {}: {}", chunk_id, e);
                return;
            }
        }

        let holders = match ledger::replica_holders(&self.db, chunk_id).await {
            Ok(holders) => holders,
            Err(e) => {
                error!("holder lookup failed for chunk {}: {}", chunk_id, e);
                return;
            }
        };
        if holders.is_empty() {
            warn!("chunk {} not found in swarm", chunk_id);
            return;
        }

        let online: Vec<(String, i64)> = self
            .sessions
            .iter()
            .filter(|(_, s)| holders.contains(&s.peer_id))
            .map(|(session_id, s)| (session_id.clone(), s.peer_id))
            .collect();
        let Some((holder_session, holder_peer)) = online.choose(&mut self.rng).cloned() else {
            warn!("chunk {} known but every holder is offline", chunk_id);
            return;
        };

        let request_id = new_hex_id();
        self.pending.insert(
            request_id.clone(),
            PendingRetrieval {
                chunk_id: chunk_id.to_string(),
                requester: Some(requester_session.to_string()),
                purpose: None,
            },
        );
        if let Some(session) = self.sessions.get(&holder_session) {
            let _ = session.tx.send(PeerMessage::RetrieveChunk {
                chunk_id: chunk_id.to_string(),
                request_id: Some(request_id),
                purpose: None,
            });
            debug!("requested chunk {} from peer {}", chunk_id, holder_peer);
        }
    }

    /// Bytes came back from a peer. Cache-purpose responses populate the
    /// overflow cache; everything else is relayed to whichever session the
    /// pending entry names. Orphaned responses are dropped.
    pub(crate) async fn on_chunk_data(
        &mut self,
        chunk_id: String,
        chunk_data: String,
        request_id: Option<String>,
        purpose: Option<RetrievePurpose>,
    ) {
        if purpose == Some(RetrievePurpose::Cache) {
            if let Some(request_id) = &request_id {
                self.pending.remove(request_id);
            }
            match decode_chunk(&chunk_data) {
                Ok(bytes) => match self.cache.put(&chunk_id, &bytes).await {
                    Ok(()) => info!("cached chunk {} locally", chunk_id),
                    Err(e) => error!("failed to cache chunk {}: {}", chunk_id, e),
                },
                Err(e) => warn!("undecodable cache payload for chunk {}: {}", chunk_id, e),
            }
            return;
        }

        let Some(request_id) = request_id else {
            debug!("uncorrelated chunk_data for {}; dropped", chunk_id);
            return;
        };
        let Some(pending) = self.pending.remove(&request_id) else {
            debug!("no pending retrieval {}; dropped", request_id);
            return;
        };
        let Some(requester) = pending.requester else {
            return;
        };
        match self.sessions.get(&requester) {
            Some(session) => {
                let _ = session.tx.send(PeerMessage::ChunkData {
                    chunk_id: chunk_id.clone(),
                    chunk_data,
                    request_id: None,
                    purpose: None,
                });
                debug!("forwarded chunk {} to requester", chunk_id);
            }
            None => debug!("requester for chunk {} disconnected; dropped", chunk_id),
        }
    }

    /// Ask a random online holder to send the chunk bytes back for caching.
    /// No-ops when the bytes are already cached or a fill is in flight.
    pub(crate) async fn cache_fill(&mut self, chunk_id: &str) {
        let in_flight = self.pending.values().any(|p| {
            p.chunk_id == chunk_id && p.purpose == Some(RetrievePurpose::Cache)
        });
        if in_flight {
            return;
        }
        match self.cache.contains(chunk_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                error!("cache probe failed for chunk {}: {}", chunk_id, e);
                return;
            }
        }

        let holders = match ledger::replica_holders(&self.db, chunk_id).await {
            Ok(holders) => holders,
            Err(e) => {
                error!("holder lookup failed for chunk {}: {}", chunk_id, e);
                return;
            }
        };
        let Some(session_id) = self
            .sessions
            .iter()
            .filter(|(_, s)| holders.contains(&s.peer_id))
            .map(|(session_id, _)| session_id.clone())
            .choose(&mut self.rng)
        else {
            warn!("cannot cache chunk {}: no online holder", chunk_id);
            return;
        };

        let request_id = new_hex_id();
        self.pending.insert(
            request_id.clone(),
            PendingRetrieval {
                chunk_id: chunk_id.to_string(),
                requester: None,
                purpose: Some(RetrievePurpose::Cache),
            },
        );
        if let Some(session) = self.sessions.get(&session_id) {
            let _ = session.tx.send(PeerMessage::RetrieveChunk {
                chunk_id: chunk_id.to_string(),
                request_id: Some(request_id),
                purpose: Some(RetrievePurpose::Cache),
            });
        }
    }

    /// Push cached bytes to one random online peer that does not yet hold a
    /// replica, mirroring ordinary distribution.
    pub(crate) async fn redistribute_from_cache(&mut self, chunk_id: &str) {
        let bytes = match self.cache.get(chunk_id).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                error!("cache read failed for chunk {}: {}", chunk_id, e);
                return;
            }
        };
        let holders = match ledger::replica_holders(&self.db, chunk_id).await {
            Ok(holders) => holders,
            Err(e) => {
                error!("holder lookup failed for chunk {}: {}", chunk_id, e);
                return;
            }
        };

        let Some(session_id) = self
            .sessions
            .iter()
            .filter(|(_, s)| !holders.contains(&s.peer_id))
            .map(|(session_id, _)| session_id.clone())
            .choose(&mut self.rng)
        else {
            debug!("no eligible peer to redistribute chunk {}", chunk_id);
            return;
        };
        if let Some(session) = self.sessions.get(&session_id) {
            let _ = session.tx.send(PeerMessage::StoreChunk {
                chunk_id: chunk_id.to_string(),
                chunk_data: encode_chunk(&bytes),
            });
            debug!(
                "redistributing cached chunk {} to peer {}",
                chunk_id, session.peer_id
            );
        }
    }
}
