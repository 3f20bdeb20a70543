//! The JSON-RPC method dispatcher the Auth Pipeline hands validated,
//! decrypted requests to. Method routing and business logic for individual
//! RPC methods live downstream of this crate; what's here is the seam and a
//! trivial default so the pipeline is exercisable end-to-end.

use latchkey_types::ClientRecord;
use serde_json::{json, Value};

/// Consumes one canonical inner JSON-RPC request (seq/nonce already
/// stripped, replay already validated) and produces the JSON-RPC response
/// body. Implementations are expected to be cheap to clone (stored behind
/// an `Arc` in `AppState`) and safe to call from many tasks concurrently —
/// the caller has already released the per-client serialization lock that
/// protects the envelope/replay state, not the dispatcher's own state.
pub trait JsonRpcDispatcher: Send + Sync {
    fn dispatch(&self, client: &ClientRecord, request: Value) -> Value;
}

/// Echoes the method name and caller identity back to the client. Useful as
/// the default dispatcher for the binary and for pipeline integration tests
/// that only care about envelope/replay behavior, not RPC semantics.
pub struct EchoDispatcher;

impl JsonRpcDispatcher for EchoDispatcher {
    fn dispatch(&self, client: &ClientRecord, request: Value) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "echo": method,
                "clientId": client.client_id,
            }
        })
    }
}
