use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Target number of confirmed replicas per chunk.
pub const REPLICA_TARGET: i64 = 5;

/// Maximum number of peers a single distribution fans out to.
pub const PLACEMENT_FANOUT: usize = 5;

/// A peer that has not re-authenticated within this window is considered
/// silent and is reaped by the next reconciliation pass.
pub const PEER_STALE_AFTER: Duration = Duration::from_secs(600);

/// Interval between reconciliation ticks.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// A chunk still unconfirmed this long after its fan-out counts as a
/// placement failure and becomes eligible for redistribution from cache.
pub const PLACEMENT_DEADLINE: Duration = Duration::from_secs(120);

/// How often a peer agent re-authenticates to refresh its liveness.
pub const REAUTH_INTERVAL: Duration = Duration::from_secs(300);

/// Replica-count-derived health of a chunk.
///
/// `Pending` is only ever assigned at creation time; every recompute maps the
/// current replica count through [`ChunkStatus::for_replica_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Ok,
    Attention,
    Warning,
}

impl ChunkStatus {
    pub fn for_replica_count(replicas: i64) -> Self {
        if replicas >= REPLICA_TARGET {
            ChunkStatus::Ok
        } else if replicas == REPLICA_TARGET - 1 {
            ChunkStatus::Attention
        } else {
            ChunkStatus::Warning
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Ok => "ok",
            ChunkStatus::Attention => "attention",
            ChunkStatus::Warning => "warning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkStatus::Pending),
            "ok" => Some(ChunkStatus::Ok),
            "attention" => Some(ChunkStatus::Attention),
            "warning" => Some(ChunkStatus::Warning),
            _ => None,
        }
    }
}

/// Marker on a retrieval distinguishing a cache fill from an ordinary
/// consumer retrieval. Ordinary retrievals omit the field entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievePurpose {
    Cache,
}

/// Bidirectional peer protocol, carried as JSON text frames over a
/// persistent WebSocket connection.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// peer → coordinator: authenticate or refresh liveness.
    #[serde(rename_all = "camelCase")]
    Auth {
        user_id: i64,
        peer_secret: String,
        #[serde(default)]
        free_storage: u64,
    },
    /// coordinator → peer: session established.
    #[serde(rename_all = "camelCase")]
    AuthOk { peer_id: i64 },
    /// coordinator → peer: store these bytes.
    #[serde(rename_all = "camelCase")]
    StoreChunk { chunk_id: String, chunk_data: String },
    /// peer → coordinator: storage confirmation.
    #[serde(rename_all = "camelCase")]
    ChunkStored { chunk_id: String, peer_id: i64 },
    /// coordinator → peer: return the bytes for this chunk.
    #[serde(rename_all = "camelCase")]
    RetrieveChunk {
        chunk_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        purpose: Option<RetrievePurpose>,
    },
    /// peer → coordinator: bytes returned, echoing correlation fields.
    #[serde(rename_all = "camelCase")]
    ChunkData {
        chunk_id: String,
        chunk_data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        purpose: Option<RetrievePurpose>,
    },
    /// peer → coordinator: the peer no longer holds the chunk.
    #[serde(rename_all = "camelCase")]
    ChunkMissing {
        chunk_id: String,
        peer_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        purpose: Option<RetrievePurpose>,
    },
    /// peer → coordinator: a consumer wants the bytes for this chunk.
    #[serde(rename_all = "camelCase")]
    RequestChunk { chunk_id: String },
    #[serde(other)]
    Unknown,
}

impl PeerMessage {
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_frame(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Base64-encode chunk bytes for the wire.
pub fn encode_chunk(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Decode chunk bytes off the wire.
pub fn decode_chunk(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    B64.decode(encoded)
}

/// Content hash of a chunk, as recorded at upload time. The uploader
/// computes this over the encrypted chunk bytes; the coordinator never
/// inspects the plaintext.
pub fn chunk_digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_frame_matches_wire_format() {
        let msg = PeerMessage::Auth {
            user_id: 4211337,
            peer_secret: "s3cret".into(),
            free_storage: 1_073_741_824,
        };
        let frame = msg.to_frame().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["userId"], 4211337);
        assert_eq!(value["peerSecret"], "s3cret");
        assert_eq!(value["freeStorage"], 1_073_741_824u64);
    }

    #[test]
    fn retrieve_frame_omits_absent_correlation_fields() {
        let plain = PeerMessage::RetrieveChunk {
            chunk_id: "abc".into(),
            request_id: None,
            purpose: None,
        };
        let frame = plain.to_frame().unwrap();
        assert!(!frame.contains("requestId"), "bare retrieve must omit requestId");
        assert!(!frame.contains("purpose"), "bare retrieve must omit purpose");

        let cache_fill = PeerMessage::RetrieveChunk {
            chunk_id: "abc".into(),
            request_id: Some("req-1".into()),
            purpose: Some(RetrievePurpose::Cache),
        };
        let value: serde_json::Value =
            serde_json::from_str(&cache_fill.to_frame().unwrap()).unwrap();
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["purpose"], "cache");
    }

    #[test]
    fn parses_frames_from_legacy_peers() {
        let frame = r#"{"type":"chunk_missing","chunkId":"c9","peerId":7,"requestId":"r1","purpose":"cache"}"#;
        match PeerMessage::from_frame(frame).unwrap() {
            PeerMessage::ChunkMissing {
                chunk_id,
                peer_id,
                request_id,
                purpose,
            } => {
                assert_eq!(chunk_id, "c9");
                assert_eq!(peer_id, 7);
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(purpose, Some(RetrievePurpose::Cache));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let unknown = PeerMessage::from_frame(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(unknown, PeerMessage::Unknown));
    }

    #[test]
    fn status_is_a_pure_function_of_replica_count() {
        assert_eq!(ChunkStatus::for_replica_count(7), ChunkStatus::Ok);
        assert_eq!(ChunkStatus::for_replica_count(5), ChunkStatus::Ok);
        assert_eq!(ChunkStatus::for_replica_count(4), ChunkStatus::Attention);
        assert_eq!(ChunkStatus::for_replica_count(3), ChunkStatus::Warning);
        assert_eq!(ChunkStatus::for_replica_count(0), ChunkStatus::Warning);
    }

    #[test]
    fn status_round_trips_through_ledger_text() {
        for status in [
            ChunkStatus::Pending,
            ChunkStatus::Ok,
            ChunkStatus::Attention,
            ChunkStatus::Warning,
        ] {
            assert_eq!(ChunkStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ChunkStatus::parse("corrupt"), None);
    }

    #[test]
    fn chunk_bytes_survive_the_wire() {
        let bytes: Vec<u8> = (0..=255).collect();
        let digest = chunk_digest_hex(&bytes);
        let encoded = encode_chunk(&bytes);
        let decoded = decode_chunk(&encoded).unwrap();
        assert_eq!(decoded, bytes, "wire round-trip must be lossless");
        assert_eq!(chunk_digest_hex(&decoded), digest);
        assert_eq!(digest.len(), 64, "digest must be 64-char hex");
    }
}
