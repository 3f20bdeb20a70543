//! WebSocket adapter (component J): IP filter and API-key check run once,
//! at the upgrade handshake; the rate limiter and the Auth Pipeline then
//! run per inbound frame, following `annex-server::api_ws`'s
//! split-handler/split-socket shape.

use crate::admission;
use crate::pipeline::{loopback_client, PipelineError};
use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use latchkey_types::RateLimitErrorFrame;
use serde::Deserialize;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
pub struct WsQuery {
    key: Option<String>,
}

/// `GET /ws`: upgrade handshake. Runs the IP filter and API-key check
/// (component I) once; per-frame admission and authentication happen in
/// [`handle_socket`].
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = addr.ip();
    let exempt = admission::is_exempt(ip, &headers);

    if !exempt {
        if !state.ip_filter.allows(ip) {
            tracing::warn!(target: "SECURITY", remote_addr = %ip, "websocket upgrade blocked by ip allow-list");
            return PipelineError::Forbidden.into_response();
        }
        if let Err(e) = admission::check_api_key(&state, &headers, params.key.as_deref()) {
            return e.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, ip, exempt))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, ip: IpAddr, exempt: bool) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        if !exempt && !state.rate_limiter.check(ip).await {
            let frame = RateLimitErrorFrame::default();
            if let Ok(json) = serde_json::to_string(&frame) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            continue;
        }

        // The per-client lock guard (when present) must outlive the
        // dispatcher call, mirroring the HTTP path's "held across the
        // downstream handler" discipline (§4.J, §9).
        let (dispatched, _guard) = if exempt {
            let dispatched = serde_json::from_str::<Value>(&text)
                .map_err(|e| PipelineError::BadRequest(format!("malformed frame: {e}")))
                .map(|body| (loopback_client(), body));
            (dispatched, None)
        } else {
            match state.auth_pipeline.process_envelope(ip, text.as_bytes()).await {
                Ok(outcome) => {
                    let dispatched = serde_json::from_slice::<Value>(&outcome.canonical_body)
                        .map_err(|e| PipelineError::Internal(format!("malformed canonical body: {e}")))
                        .map(|body| (outcome.client, body));
                    (dispatched, Some(outcome.guard))
                }
                Err(e) => (Err(e), None),
            }
        };

        let reply = match dispatched {
            Ok((client, body)) => state.dispatcher.dispatch(&client, body),
            Err(e) => serde_json::json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": { "code": -32000, "message": e.to_string() },
            }),
        };
        drop(_guard);

        if let Ok(json) = serde_json::to_string(&reply) {
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    }
}
