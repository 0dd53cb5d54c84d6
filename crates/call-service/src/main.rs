//! Ringline Call Service
//!
//! Call signaling relay and call lifecycle coordinator.
//!
//! # Servers
//!
//! - HTTP server for the signaling websocket and history API (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing
//! 3. Initialize Prometheus metrics recorder
//! 4. Open the call record store (Postgres when `DATABASE_URL` is set)
//! 5. Initialize actor system (`CallSupervisorHandle`)
//! 6. Start health HTTP server (liveness, readiness, metrics)
//! 7. Start signaling HTTP server
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use call_service::actors::{ActorMetrics, CallContext, CallSettings, CallSupervisorHandle};
use call_service::config::Config;
use call_service::dispatch::EventDispatcher;
use call_service::notify::LogNotifier;
use call_service::observability::{health_router, init_metrics_recorder, HealthState};
use call_service::registry::SessionRegistry;
use call_service::relay::SignalingRelay;
use call_service::routes::{build_routes, AppState};
use call_service::store::{CallRecordStore, MemoryCallStore, PgCallStore};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to live calls to settle on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    let json_logs = config.observability.json_logs;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.observability.log_filter.clone().into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting Call Service");
    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        persistent_store = config.database.is_some(),
        ring_timeout_seconds = config.ring_timeout_seconds,
        terminal_retention_seconds = config.terminal_retention_seconds,
        max_active_calls = config.max_active_calls,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());

    let store: Arc<dyn CallRecordStore> = match &config.database {
        Some(db) => {
            info!("Connecting to Postgres...");
            let store = PgCallStore::connect(&db.url, db.max_connections)
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to open call record store");
                    e
                })?;
            info!("Postgres call record store ready");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, call records are kept in memory only");
            Arc::new(MemoryCallStore::new())
        }
    };

    info!("Initializing actor system...");
    let registry = Arc::new(SessionRegistry::new());
    let ctx = CallContext {
        registry: Arc::clone(&registry),
        relay: SignalingRelay::new(Arc::clone(&registry)),
        store: Arc::clone(&store),
        notifier: Arc::new(LogNotifier),
        metrics: ActorMetrics::new(),
        settings: CallSettings {
            ring_timeout: config.ring_timeout(),
            terminal_retention: config.terminal_retention(),
        },
    };
    let supervisor =
        CallSupervisorHandle::new(config.instance_id.clone(), ctx, config.max_active_calls);
    info!("Actor system initialized");

    let shutdown_token = supervisor.child_token();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let bind_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let app = build_routes(AppState {
        dispatcher: EventDispatcher::new(Arc::clone(&registry), supervisor.clone()),
        store,
        outbox_capacity: config.session_outbox_capacity,
    });

    let listener = tokio::net::TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(error = %e, addr = %bind_addr, "Failed to bind signaling server");
        format!("Failed to bind signaling server to {bind_addr}: {e}")
    })?;

    let server_shutdown_token = shutdown_token.child_token();
    let server = tokio::spawn(async move {
        info!(addr = %bind_addr, "Signaling server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
            info!("Signaling server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("Call Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Settle live calls while sessions can still receive the final events
    if let Err(e) = supervisor.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    shutdown_token.cancel();
    if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
        warn!("Signaling server did not stop in time");
    }

    info!("Call Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
