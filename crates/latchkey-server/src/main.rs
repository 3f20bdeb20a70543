//! latchkey-server binary — HTTP/WebSocket front door for the Auth
//! Pipeline, plus a `--register` CLI for provisioning new clients (§10.P).

use axum::Router;
use latchkey_locks::ClientLockManager;
use latchkey_net::{IpFilter, RateLimiter};
use latchkey_server::config::{Config, SecurityConfig};
use latchkey_server::dispatch::EchoDispatcher;
use latchkey_server::pipeline::AuthPipeline;
use latchkey_server::{app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &latchkey_server::config::LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// `latchkey-server --register <name>`: provisions a new client and prints
/// its client ID and plaintext bearer token. The token is shown exactly
/// once — only its hash is ever persisted.
fn run_register(config: &Config, name: &str) {
    let pool = latchkey_db::create_pool_with_settings(
        &config.database.path,
        latchkey_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to open database for registration");

    let conn = pool.get().expect("failed to get database connection");
    latchkey_db::run_migrations(&conn).expect("failed to run database migrations");

    let (client_id, token) =
        latchkey_db::insert_client(&conn, name).expect("failed to register client");

    println!("client_id: {client_id}");
    println!("auth_token: {token}");
    println!("(this token is shown only once; store it in the client's configuration now)");
}

fn ip_filter_from(security: &SecurityConfig) -> Arc<IpFilter> {
    let allowed = security.allowed_ips.clone();
    Arc::new(IpFilter::new(Arc::new(move || allowed.clone())))
}

#[tokio::main]
async fn main() {
    let config = latchkey_server::config::load_config(Some("config.toml"))
        .expect("failed to load configuration — the server cannot start without valid config");

    init_tracing(&config.logging);

    let mut args = std::env::args().skip(1);
    if let Some(flag) = args.next() {
        if flag == "--register" {
            let name = args
                .next()
                .expect("usage: latchkey-server --register <client-name>");
            run_register(&config, &name);
            return;
        }
    }

    let pool = latchkey_db::create_pool_with_settings(
        &config.database.path,
        latchkey_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool.get().expect("failed to get database connection for migrations");
        let applied = latchkey_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let store: Arc<dyn latchkey_db::ClientStore> =
        Arc::new(latchkey_db::SqliteClientStore::new(pool));
    let lock_manager = Arc::new(ClientLockManager::new());
    let rate_limiter = match (config.security.rpm_override, config.security.burst_override) {
        (Some(rpm), Some(burst)) => Arc::new(RateLimiter::with_rate(rpm, burst)),
        (Some(rpm), None) => Arc::new(RateLimiter::with_rate(rpm, latchkey_types::BURST)),
        (None, Some(burst)) => Arc::new(RateLimiter::with_rate(latchkey_types::RPM, burst)),
        (None, None) => Arc::new(RateLimiter::new()),
    };
    let ip_filter = ip_filter_from(&config.security);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    lock_manager.start_sweeper(
        Duration::from_secs(latchkey_types::MUTEX_CLEANUP_INTERVAL_SECS),
        shutdown_rx,
    );
    rate_limiter.start_sweeper();

    let state = AppState {
        auth_pipeline: AuthPipeline::new(store, lock_manager.clone()),
        ip_filter,
        rate_limiter,
        lock_manager,
        api_keys: config.security.api_keys.clone(),
        dispatcher: Arc::new(EchoDispatcher),
        max_request_body_bytes: config.server.max_request_body_bytes,
    };

    let router: Router = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting latchkey server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .expect("server error");

    tracing::info!("latchkey server shut down");
}

/// Waits for SIGINT or SIGTERM, then signals the background sweepers to
/// stop before axum's own graceful shutdown drains in-flight connections.
async fn shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }

    let _ = shutdown_tx.send(true);
}
