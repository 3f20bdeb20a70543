//! Shared types and constants for the Latchkey authenticated request pipeline.
//!
//! This crate provides the foundational types used across every Latchkey
//! crate: the fixed protocol constants, the persisted client record, and the
//! wire-format envelope types. No crate in the workspace depends on anything
//! *except* `latchkey-types` for cross-cutting type definitions, keeping the
//! dependency graph a clean fan-out from here.

use serde::{Deserialize, Serialize};

/// Number of 64-bit blocks in the sliding-window ring.
pub const RING_BLOCKS: usize = 128;

/// Number of counter positions tracked by the ring, trailing the highest
/// accepted counter. One block's worth is reserved as the "current" block,
/// so only `RING_BLOCKS - 1` blocks of history are guaranteed available.
pub const WINDOW_SIZE: u64 = (RING_BLOCKS as u64 - 1) * 64;

/// Mask for wrapping a block index into the ring.
pub const BLOCK_MASK: usize = RING_BLOCKS - 1;

/// Mask for extracting the bit offset within a block.
pub const BIT_MASK: u64 = 63;

/// Highest sequence number a client may ever present, matching WireGuard's
/// `RejectAfterMessages`.
pub const MAX_SEQ: u64 = u64::MAX - (1 << 13) - 1;

/// Maximum number of recently-seen nonces retained per client.
pub const NONCE_CACHE_SIZE: usize = 100;

/// Idle duration after which an unused per-client lock entry is evicted.
pub const MUTEX_MAX_IDLE_SECS: u64 = 30 * 60;

/// Interval between lock-manager sweeps.
pub const MUTEX_CLEANUP_INTERVAL_SECS: u64 = 10 * 60;

/// Default requests-per-minute for the per-IP token bucket.
pub const RPM: u64 = 100;

/// Burst capacity for the per-IP token bucket.
pub const BURST: u64 = 20;

/// Interval between rate-limiter sweeps.
pub const RATELIMIT_SWEEP_SECS: u64 = 5 * 60;

/// Idle duration after which a rate-limiter bucket is evicted.
pub const RATELIMIT_MAX_IDLE_SECS: u64 = 10 * 60;

/// Total byte size of a serialized sequence-window blob: `last` (8 bytes)
/// plus `RING_BLOCKS` ring blocks (8 bytes each).
pub const SEQ_WINDOW_BLOB_SIZE: usize = 8 + 8 * RING_BLOCKS;

/// A registered remote caller: identity, shared secret, and persisted
/// replay state.
///
/// This is the unit the Client Store (component C) reads and writes. The
/// `seq_window` blob and `nonce_cache` are opaque to the store; only the
/// replay protector interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    /// Opaque unique identifier, assigned at registration.
    pub client_id: String,
    /// Human label for the client.
    pub client_name: String,
    /// SHA-256 hex digest of the bearer token. Tokens are never stored
    /// plaintext.
    pub auth_token_hash: String,
    /// 32 raw bytes, the AES-256-GCM key shared with this client.
    pub shared_secret: [u8; 32],
    /// Highest sequence number ever accepted from this client.
    pub current_seq: u64,
    /// Serialized sliding-window state (`SEQ_WINDOW_BLOB_SIZE` bytes when
    /// present and non-empty).
    pub seq_window: Vec<u8>,
    /// Up to `NONCE_CACHE_SIZE` most-recently-accepted nonces, oldest first.
    pub nonce_cache: Vec<String>,
    /// Unix timestamp (seconds) of record creation.
    pub created_at: i64,
    /// Unix timestamp (seconds) of the last accepted request.
    pub last_seen: i64,
}

/// The outer encrypted envelope as it appears on the wire (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterEnvelope {
    /// Base64 (standard, padded) AES-256-GCM ciphertext plus tag.
    pub encrypted: String,
    /// Base64 (standard, padded) 12-byte IV.
    pub iv: String,
    /// Opaque bearer token identifying the client.
    #[serde(rename = "authToken")]
    pub auth_token: String,
}

/// The decrypted inner JSON-RPC payload (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerPayload {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub seq: u64,
    pub nonce: String,
}

/// JSON-RPC error frame emitted over WebSocket when the rate limiter rejects
/// a frame (§6). The connection is not closed.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitErrorFrame {
    pub jsonrpc: &'static str,
    pub id: Option<()>,
    pub error: RateLimitError,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitError {
    pub code: i32,
    pub message: &'static str,
}

impl Default for RateLimitErrorFrame {
    fn default() -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            error: RateLimitError {
                code: -32000,
                message: "Rate limit exceeded",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_matches_spec() {
        assert_eq!(WINDOW_SIZE, 127 * 64);
    }

    #[test]
    fn max_seq_matches_wireguard_reject_after_messages() {
        assert_eq!(MAX_SEQ, u64::MAX - 8192 - 1);
    }

    #[test]
    fn seq_window_blob_size_is_1032() {
        assert_eq!(SEQ_WINDOW_BLOB_SIZE, 1032);
    }

    #[test]
    fn rate_limit_error_frame_serializes_per_spec() {
        let frame = RateLimitErrorFrame::default();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert!(json["id"].is_null());
        assert_eq!(json["error"]["code"], -32000);
        assert_eq!(json["error"]["message"], "Rate limit exceeded");
    }

    #[test]
    fn outer_envelope_round_trips_auth_token_field_name() {
        let json = r#"{"encrypted":"AA==","iv":"BB==","authToken":"tok"}"#;
        let env: OuterEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.auth_token, "tok");
        let back = serde_json::to_string(&env).unwrap();
        assert!(back.contains("\"authToken\""));
    }
}
