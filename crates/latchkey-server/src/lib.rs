//! latchkey-server library logic.

pub mod admission;
pub mod config;
pub mod dispatch;
pub mod middleware;
pub mod pipeline;
pub mod ws;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use dispatch::JsonRpcDispatcher;
use middleware::ClientContext;
use pipeline::AuthPipeline;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across all request handlers. `ip_filter`,
/// `rate_limiter`, and `lock_manager` are also reachable through
/// `auth_pipeline`/`admission` for request handling, but are kept here too
/// so `main.rs` can start their background sweepers independently of any
/// request ever arriving.
pub struct AppState {
    pub auth_pipeline: AuthPipeline,
    pub ip_filter: Arc<latchkey_net::IpFilter>,
    pub rate_limiter: Arc<latchkey_net::RateLimiter>,
    pub lock_manager: Arc<latchkey_locks::ClientLockManager>,
    pub api_keys: Vec<String>,
    pub dispatcher: Arc<dyn JsonRpcDispatcher>,
    pub max_request_body_bytes: usize,
}

/// Health check handler. Exempt from the admission chain and the Auth
/// Pipeline entirely (§10.L) — it answers even when the database or a
/// downstream dependency is unhealthy, so a load balancer can still tell
/// the process is alive.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// The single JSON-RPC entry point. By the time this handler runs, the
/// envelope has already been authenticated, decrypted, and replay-checked
/// by [`middleware::gate_middleware`]; the per-client lock is still held by
/// the middleware's stack frame for the duration of this call. A missing
/// `ClientContext` means the loopback/localhost exemption (§4.I) skipped
/// the pipeline entirely, so the request is attributed to the anonymous
/// local identity instead.
async fn rpc_handler(
    Extension(state): Extension<Arc<AppState>>,
    context: Option<Extension<ClientContext>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let client = match context {
        Some(Extension(ClientContext(client))) => client,
        None => pipeline::loopback_client(),
    };
    Json(state.dispatcher.dispatch(&client, body))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let max_body = state.max_request_body_bytes;
    let state = Arc::new(state);

    let rpc_routes = Router::new()
        .route("/rpc", post(rpc_handler))
        .layer(axum::middleware::from_fn(middleware::gate_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(rpc_routes)
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use dispatch::EchoDispatcher;
    use latchkey_db::{create_pool, run_migrations, SqliteClientStore};
    use latchkey_locks::ClientLockManager;
    use latchkey_net::{IpFilter, RateLimiter};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let pool = create_pool(":memory:").unwrap();
        {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
        }
        let store: Arc<dyn latchkey_db::ClientStore> = Arc::new(SqliteClientStore::new(pool));
        let locks = Arc::new(ClientLockManager::new());
        AppState {
            auth_pipeline: AuthPipeline::new(store, locks.clone()),
            ip_filter: Arc::new(IpFilter::new(Arc::new(|| Vec::new()))),
            rate_limiter: Arc::new(RateLimiter::new()),
            lock_manager: locks,
            api_keys: Vec::new(),
            dispatcher: Arc::new(EchoDispatcher),
            max_request_body_bytes: 2 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let app = app(test_state());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn rpc_without_envelope_body_is_bad_request_not_loopback_bypassed() {
        // This exercises the router wiring: a non-loopback ConnectInfo is
        // required for gate_middleware to run at all, so this hits the
        // into_make_service_with_connect_info requirement rather than the
        // app's own routing; absence of ConnectInfo surfaces as a 500 here.
        let app = app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/rpc")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
