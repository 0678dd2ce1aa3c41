use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    Router,
    extract::{Query, State, ws::WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::{any, get},
};
use clap::Parser;
use tracing::{info, warn};

mod allocator;
mod channel;
mod config;
mod forwarder;
mod registry;
mod router;

use allocator::SubdomainAllocator;
use config::{RelayConfig, ShutdownMode};
use forwarder::Forwarder;
use registry::SessionRegistry;
use relaymux_shared::protocol::ErrorCode;

#[derive(Clone)]
pub struct AppState {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    forwarder: Arc<Forwarder>,
    allocator: Arc<SubdomainAllocator>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaymux_server=info,tower_http=info".into()),
        )
        .init();

    let config = Arc::new(RelayConfig::parse());

    let registry = Arc::new(SessionRegistry::new());
    let forwarder = Forwarder::new(registry.clone());
    registry.install_completer(forwarder.clone());
    let allocator = Arc::new(SubdomainAllocator::new(
        config.subdomain_length,
        config.allocator_attempts,
    )?);

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        forwarder: forwarder.clone(),
        allocator,
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .fallback(any(router::proxy_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, domain = %config.domain, "relay listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config, registry, forwarder))
        .await?;
    Ok(())
}

/// Drives the shutdown sequence: stop accepting new public requests
/// (handled by `axum`'s graceful-shutdown future resolving), notify every
/// connected client, then either wait for the pending table to drain or
/// fail it outright, before clearing the registry.
async fn shutdown_signal(
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    forwarder: Arc<Forwarder>,
) {
    tokio::signal::ctrl_c().await.ok();
    let sessions = registry.list();
    info!(
        sessions = sessions.len(),
        pending = forwarder.pending_count(),
        mode = ?config.shutdown_mode,
        "shutdown signal received"
    );

    let notice = channel::shutdown_notice();
    for session in &sessions {
        let _ = session.outbound.send(notice.clone()).await;
    }

    match config.shutdown_mode {
        ShutdownMode::Immediate => {
            forwarder.fail_all(ErrorCode::ServerError);
        }
        ShutdownMode::Graceful => {
            let deadline = config.graceful_shutdown_timeout();
            let drained = tokio::time::timeout(deadline, wait_for_drain(&forwarder)).await;
            if drained.is_err() {
                warn!(
                    remaining = forwarder.pending_count(),
                    "graceful shutdown timeout elapsed, failing remaining requests"
                );
            }
            forwarder.fail_all(ErrorCode::ServerError);
        }
    }

    registry.clear();
}

async fn wait_for_drain(forwarder: &Forwarder) {
    while forwarder.pending_count() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Upgrades a connection to a tunnel channel. The client presents its
/// shared secret via the `X-Relay-Secret-Key` header and may request a
/// preferred subdomain via the `?subdomain=` query parameter.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let presented_secret = headers
        .get("x-relay-secret-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let requested_subdomain = params.get("subdomain").cloned();

    let secret_keys = state.config.secret_key_set();
    let domain = state.config.domain.clone();
    let registry = state.registry.clone();
    let forwarder = state.forwarder.clone();
    let allocator = state.allocator.clone();
    let heartbeat_interval = state.config.heartbeat_interval();

    ws.on_upgrade(move |socket| async move {
        channel::run(
            socket,
            secret_keys,
            presented_secret,
            requested_subdomain,
            domain,
            registry,
            forwarder,
            allocator,
            heartbeat_interval,
        )
        .await;
    })
}
