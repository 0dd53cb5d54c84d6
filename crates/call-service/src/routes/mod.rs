//! HTTP routes for the Call Service.
//!
//! Defines the Axum router and application state.

use crate::dispatch::EventDispatcher;
use crate::handlers;
use crate::store::CallRecordStore;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Routes client frames for every websocket session.
    pub dispatcher: EventDispatcher,

    /// Call records, read by the history API.
    pub store: Arc<dyn CallRecordStore>,

    /// Outbound queue capacity per websocket session.
    pub outbox_capacity: usize,
}

/// Build the application routes.
///
/// - `/ws` - signaling websocket
/// - `/api/v1/users/:user_id/calls` - call history
/// - TraceLayer for request logging
///
/// Health and metrics are served separately on the health bind address.
pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/api/v1/users/:user_id/calls", get(handlers::list_user_calls))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
