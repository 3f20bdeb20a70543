//! HTTP-side wiring for connection admission (F, G, I) and the Auth
//! Pipeline (H), expressed as an `axum::middleware::from_fn` layer in the
//! same shape as `annex-server::middleware::{auth_middleware,
//! rate_limit_middleware}`.

use crate::admission;
use crate::pipeline::PipelineError;
use crate::AppState;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use latchkey_types::ClientRecord;
use std::net::SocketAddr;
use std::sync::Arc;

/// Wraps the authenticated client attached to a request by the Auth
/// Pipeline, for downstream handlers to read via `Extension<ClientContext>`.
#[derive(Clone)]
pub struct ClientContext(pub ClientRecord);

/// The single middleware layer implementing §2's control-flow diagram for
/// HTTP: IP filter, rate limiter, loopback bypass, then the full envelope
/// Auth Pipeline. Kept as one function (rather than three stacked tower
/// layers) so the loopback bypass decision is made exactly once and
/// consistently skips every one of F/G/H, matching the "on a non-loopback
/// HTTP request" framing of the control-flow diagram.
pub async fn gate_middleware(req: Request<Body>, next: Next) -> Result<Response, PipelineError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .cloned()
        .ok_or_else(|| PipelineError::Internal("app state missing from request".to_string()))?;

    let ConnectInfo(addr) = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .cloned()
        .ok_or_else(|| PipelineError::Internal("connection info missing from request".to_string()))?;
    let ip = addr.ip();

    if admission::is_exempt(ip, req.headers()) {
        return Ok(next.run(req).await);
    }

    admission::check_ip_and_rate(&state, ip).await?;

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, state.max_request_body_bytes)
        .await
        .map_err(|e| PipelineError::BadRequest(format!("failed to read request body: {e}")))?;

    let outcome = state.auth_pipeline.process_envelope(ip, &bytes).await?;

    let mut req = Request::from_parts(parts, Body::from(outcome.canonical_body));
    req.extensions_mut().insert(ClientContext(outcome.client));

    // The guard is held for the remainder of this function, including the
    // downstream handler invocation (§9 "holding the lock across the
    // downstream handler"), and drops only once `next.run` resolves.
    let _guard = outcome.guard;
    Ok(next.run(req).await)
}

/// The independent, optional API-key authenticator (component I) for
/// routes that bypass the envelope pipeline entirely. Loopback callers are
/// exempt, matching §4.I's framing that the bypass and this check share
/// the same trust boundary.
pub async fn api_key_middleware(req: Request<Body>, next: Next) -> Result<Response, PipelineError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .cloned()
        .ok_or_else(|| PipelineError::Internal("app state missing from request".to_string()))?;

    let ConnectInfo(addr) = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .cloned()
        .ok_or_else(|| PipelineError::Internal("connection info missing from request".to_string()))?;

    if admission::is_exempt(addr.ip(), req.headers()) {
        return Ok(next.run(req).await);
    }

    let query = req.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("key="))
            .map(|v| v.to_string())
    });
    admission::check_api_key(&state, req.headers(), query.as_deref())?;

    Ok(next.run(req).await)
}
