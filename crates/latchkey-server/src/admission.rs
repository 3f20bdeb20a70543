//! Connection admission checks shared by the HTTP middleware chain and the
//! WebSocket upgrade handshake: IP allow-listing (F), per-IP rate limiting
//! (G), the optional static API-key authenticator (I), and the loopback
//! bypass test (§4.I).

use crate::pipeline::PipelineError;
use crate::AppState;
use axum::http::HeaderMap;
use latchkey_net::is_loopback;
use std::net::IpAddr;

/// `true` when `ip` (or the literal `Host: localhost`) should skip the
/// entire admission-and-auth chain — IP filter, rate limiter, API-key
/// check, and the envelope pipeline all bypass for a trusted local caller.
pub fn is_exempt(ip: IpAddr, headers: &HeaderMap) -> bool {
    if is_loopback(ip) {
        return true;
    }
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host))
        .is_some_and(|host| host.eq_ignore_ascii_case("localhost"))
}

/// Runs the IP allow-list (F) then the per-IP rate limiter (G) against
/// `ip`. Order matters: a blocked IP is reported as 403 even if its bucket
/// also happens to be empty.
pub async fn check_ip_and_rate(state: &AppState, ip: IpAddr) -> Result<(), PipelineError> {
    if !state.ip_filter.allows(ip) {
        tracing::warn!(target: "SECURITY", remote_addr = %ip, "blocked by ip allow-list");
        return Err(PipelineError::Forbidden);
    }
    if !state.rate_limiter.check(ip).await {
        return Err(PipelineError::TooManyRequests);
    }
    Ok(())
}

/// The secondary API-key authenticator (component I). Only enforced when
/// `security.api_keys` is non-empty; the header takes precedence over the
/// query parameter when both are present.
pub fn check_api_key(
    state: &AppState,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<(), PipelineError> {
    if state.api_keys.is_empty() {
        return Ok(());
    }

    let header_key = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let presented = header_key.or(query);

    match presented {
        Some(key) if state.api_keys.iter().any(|k| k == key) => Ok(()),
        _ => Err(PipelineError::Unauthorized),
    }
}
