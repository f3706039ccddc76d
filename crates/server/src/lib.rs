// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Spindle: real-time traffic-shaping control plane.
//!
//! Instrumented browser clients hold a persistent socket at `/ws`, stream
//! telemetry, and receive remote commands. Operators steer sessions through
//! the `/admin` API; the server demotes abusive sessions on its own via the
//! rate limiter. Telemetry lands in an append-only event store, session
//! state in a transactional store — both optional at runtime.

pub mod bus;
pub mod config;
pub mod error;
pub mod geo;
pub mod limiter;
pub mod maintenance;
pub mod protocol;
pub mod registry;
pub mod sink;
pub mod state;
pub mod store;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::state::AppState;
use crate::transport::build_router;

/// Run the server until shutdown.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let timeouts = config.store_timeouts();
    let events =
        Arc::new(store::events::EventStore::connect(config.event_store_url.as_deref(), timeouts).await);
    let sessions = Arc::new(
        store::sessions::SessionStore::connect(config.session_store_url.as_deref(), timeouts).await,
    );
    if config.require_stores && !(events.is_enabled() && sessions.is_enabled()) {
        anyhow::bail!("stores required but unavailable");
    }

    let geo = geo::GeoResolver::load(config.geoip_data.as_deref());
    let (writer, writer_handle) =
        store::writer::spawn_writer(Arc::clone(&sessions), Arc::clone(&events), shutdown.clone());

    let nats_url = config.nats_url.clone();
    let state = Arc::new(AppState::new(config, events, sessions, writer, geo, shutdown.clone()));

    let flusher = sink::spawn_flusher(
        Arc::clone(&state.sink),
        Arc::clone(&state.events),
        shutdown.clone(),
    );
    bus::spawn_dispatcher(Arc::clone(&state));
    if let Some(url) = nats_url {
        bus::spawn_nats_bridge(Arc::clone(&state), url);
    }
    maintenance::spawn_maintenance(Arc::clone(&state));

    // Ctrl-C / SIGTERM initiate the graceful sequence.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(node = %state.bus.node_id(), "spindle listening on {addr}");
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // Stopped accepting; drain the write paths, then release the stores.
    shutdown.cancel();
    let _ = flusher.await;
    let _ = writer_handle.await;
    state.events.close().await;
    state.sessions.close().await;
    tracing::info!("spindle stopped");
    Ok(())
}
