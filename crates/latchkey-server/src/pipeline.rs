//! The Auth Pipeline (component H): orchestrates the Replay Protector (B),
//! Client Store (C), Client Lock Manager (D), and Envelope Codec (E) on
//! every non-loopback request. This module is transport-agnostic — it
//! takes raw bytes in and hands back a canonical inner JSON-RPC body plus
//! the client record, independent of whether the caller is the HTTP
//! middleware or the WebSocket per-frame adapter (§4.J).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use latchkey_db::ClientStore;
use latchkey_locks::ClientLockManager;
use latchkey_replay::ReplayProtector;
use latchkey_types::{ClientRecord, InnerPayload, OuterEnvelope};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

/// Error disposition for the Auth Pipeline, mapped 1:1 to the HTTP status
/// table in §7.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("authentication failed")]
    Unauthorized,
    #[error("ip not allowed")]
    Forbidden,
    #[error("rate limit exceeded")]
    TooManyRequests,
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::Unauthorized => StatusCode::UNAUTHORIZED,
            PipelineError::Forbidden => StatusCode::FORBIDDEN,
            PipelineError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = axum::Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Result of a successful pass through the envelope pipeline: the
/// authenticated client, the canonical inner JSON-RPC body, and the
/// per-client lock guard. The guard is deliberately part of the return
/// value — callers must hold it across the downstream handler invocation
/// (§9 "Holding the lock across the downstream handler"), only dropping it
/// once the response has been produced.
pub struct EnvelopeOutcome {
    pub client: ClientRecord,
    pub canonical_body: Vec<u8>,
    pub guard: OwnedMutexGuard<()>,
}

/// The anonymous identity attributed to a request that bypassed the Auth
/// Pipeline entirely under the loopback/localhost exemption (§4.I) — it
/// never went through envelope auth, so it carries no authenticated client
/// record. Shared by the HTTP and WebSocket adapters.
pub(crate) fn loopback_client() -> ClientRecord {
    ClientRecord {
        client_id: "loopback".to_string(),
        client_name: "loopback".to_string(),
        auth_token_hash: String::new(),
        shared_secret: [0u8; 32],
        current_seq: 0,
        seq_window: Vec::new(),
        nonce_cache: Vec::new(),
        created_at: 0,
        last_seen: 0,
    }
}

/// Bundles the collaborators the Auth Pipeline depends on (B, C, D, E),
/// independent of transport.
#[derive(Clone)]
pub struct AuthPipeline {
    store: Arc<dyn ClientStore>,
    locks: Arc<ClientLockManager>,
}

impl AuthPipeline {
    pub fn new(store: Arc<dyn ClientStore>, locks: Arc<ClientLockManager>) -> Self {
        Self { store, locks }
    }

    /// Runs steps 2-13 of §4.H against `raw_body` from `remote_ip`. Callers
    /// are responsible for steps 0-1 (IP filter, rate limit, loopback
    /// bypass) and for invoking the downstream handler with the result.
    pub async fn process_envelope(
        &self,
        remote_ip: IpAddr,
        raw_body: &[u8],
    ) -> Result<EnvelopeOutcome, PipelineError> {
        // Step 2: parse the outer envelope.
        let envelope: OuterEnvelope = serde_json::from_slice(raw_body)
            .map_err(|e| PipelineError::BadRequest(format!("malformed envelope: {e}")))?;

        // Step 3: look up the client by auth token (identity only).
        let prefix: String = envelope.auth_token.chars().take(8).collect();
        let identity = self.store.get_by_auth_token(&envelope.auth_token).map_err(|e| {
            tracing::warn!(
                target: "SECURITY",
                token_prefix = %prefix,
                remote_addr = %remote_ip,
                error = %e,
                "auth token lookup failed"
            );
            PipelineError::Unauthorized
        })?;
        let client_id = identity.client_id.clone();

        // Step 4: acquire the per-client lock. Everything from here runs
        // under it, including the eventual downstream handler invocation.
        let guard = self.locks.lock(&client_id).await;

        // Step 5: re-fetch under lock — the authoritative replay state.
        let client = self.store.get_by_id(&client_id).map_err(|e| {
            PipelineError::Internal(format!("client vanished under lock: {e}"))
        })?;

        // Step 6: decrypt.
        let plaintext = latchkey_crypto::decrypt(&envelope.encrypted, &envelope.iv, &client.shared_secret)
            .map_err(|_| PipelineError::BadRequest("decryption failed".to_string()))?;

        // Step 7: parse the decrypted inner payload.
        let inner: InnerPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| PipelineError::BadRequest(format!("malformed inner payload: {e}")))?;

        // Step 8-9: build the replay protector and validate.
        let mut protector = ReplayProtector::new(&client);
        if !protector.validate(inner.seq, &inner.nonce) {
            tracing::warn!(
                target: "SECURITY",
                client_id = %client_id,
                seq = inner.seq,
                nonce = %inner.nonce,
                remote_addr = %remote_ip,
                "replay attack detected"
            );
            return Err(PipelineError::BadRequest("replay detected".to_string()));
        }

        // Step 10-11: commit and persist.
        protector.update(inner.nonce.clone());
        let (current_seq, seq_window, nonce_cache) = protector.snapshot();
        self.store
            .update_sequence(&client_id, current_seq, &seq_window, &nonce_cache)
            .map_err(|e| PipelineError::Internal(format!("failed to persist replay state: {e}")))?;

        // Step 12: synthesize the canonical inner JSON-RPC body.
        let mut canonical = serde_json::Map::new();
        canonical.insert("jsonrpc".to_string(), Value::String(inner.jsonrpc.clone()));
        canonical.insert("method".to_string(), Value::String(inner.method.clone()));
        if let Some(id) = inner.id.clone() {
            canonical.insert("id".to_string(), id);
        }
        if let Some(params) = inner.params.clone() {
            canonical.insert("params".to_string(), params);
        }
        let canonical_body = serde_json::to_vec(&Value::Object(canonical))
            .map_err(|e| PipelineError::Internal(format!("failed to encode canonical body: {e}")))?;

        Ok(EnvelopeOutcome {
            client,
            canonical_body,
            guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_crypto::encrypt;
    use latchkey_db::{create_pool, insert_client, run_migrations, SqliteClientStore};

    fn pipeline_with_client() -> (AuthPipeline, ClientRecord, String) {
        let pool = create_pool(":memory:").unwrap();
        let (client_id, token) = {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
            insert_client(&conn, "test-client").unwrap()
        };
        let store: Arc<dyn ClientStore> = Arc::new(SqliteClientStore::new(pool));
        let client = store.get_by_id(&client_id).unwrap();
        let locks = Arc::new(ClientLockManager::new());
        (AuthPipeline::new(store, locks), client, token)
    }

    fn envelope_for(client: &ClientRecord, token: &str, seq: u64, nonce: &str) -> Vec<u8> {
        let inner = json!({
            "jsonrpc": "2.0",
            "method": "ping",
            "id": 1,
            "seq": seq,
            "nonce": nonce,
        });
        let plaintext = serde_json::to_vec(&inner).unwrap();
        let (encrypted, iv) = encrypt(&plaintext, &client.shared_secret);
        serde_json::to_vec(&json!({
            "encrypted": encrypted,
            "iv": iv,
            "authToken": token,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn fresh_request_is_accepted_and_state_committed() {
        let (pipeline, client, token) = pipeline_with_client();
        let body = envelope_for(&client, &token, 1, "nonce-a");

        let outcome = pipeline
            .process_envelope("127.0.0.1".parse().unwrap(), &body)
            .await
            .expect("should succeed");
        assert_eq!(outcome.client.client_id, client.client_id);

        let canonical: Value = serde_json::from_slice(&outcome.canonical_body).unwrap();
        assert_eq!(canonical["method"], "ping");
        assert!(canonical.get("seq").is_none());
        assert!(canonical.get("nonce").is_none());
    }

    #[tokio::test]
    async fn replay_of_same_seq_and_nonce_is_rejected() {
        let (pipeline, client, token) = pipeline_with_client();
        let body = envelope_for(&client, &token, 1, "nonce-a");

        pipeline
            .process_envelope("127.0.0.1".parse().unwrap(), &body)
            .await
            .expect("first request should succeed");

        let err = pipeline
            .process_envelope("127.0.0.1".parse().unwrap(), &body)
            .await
            .expect_err("replay should be rejected");
        assert!(matches!(err, PipelineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn unknown_auth_token_is_unauthorized() {
        let (pipeline, client, _token) = pipeline_with_client();
        let body = envelope_for(&client, "totally-wrong-token", 1, "nonce-a");
        let err = pipeline
            .process_envelope("127.0.0.1".parse().unwrap(), &body)
            .await
            .expect_err("unknown token should fail");
        assert!(matches!(err, PipelineError::Unauthorized));
    }

    #[tokio::test]
    async fn malformed_envelope_is_bad_request() {
        let (pipeline, _client, _token) = pipeline_with_client();
        let err = pipeline
            .process_envelope("127.0.0.1".parse().unwrap(), b"not json")
            .await
            .expect_err("malformed envelope should fail");
        assert!(matches!(err, PipelineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn wrong_key_decryption_failure_is_bad_request() {
        let (pipeline, mut client, token) = pipeline_with_client();
        client.shared_secret = [0xEE; 32]; // wrong key baked into the envelope
        let body = envelope_for(&client, &token, 1, "nonce-a");
        let err = pipeline
            .process_envelope("127.0.0.1".parse().unwrap(), &body)
            .await
            .expect_err("decryption should fail");
        assert!(matches!(err, PipelineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn ten_concurrent_identical_requests_exactly_one_wins() {
        let (pipeline, client, token) = pipeline_with_client();
        let pipeline = Arc::new(pipeline);
        let body = Arc::new(envelope_for(&client, &token, 6, "x"));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pipeline = pipeline.clone();
            let body = body.clone();
            handles.push(tokio::spawn(async move {
                pipeline
                    .process_envelope("10.0.0.5".parse().unwrap(), &body)
                    .await
                    .is_ok()
            }));
        }

        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }
}
