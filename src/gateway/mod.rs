//! Session Gateway
//!
//! WebSocket entry point, per-connection sessions and the connection
//! registry. Commands carry the authenticated identity assigned at
//! connect time; clients cannot spoof another bidder by payload field.

pub mod connections;
pub mod protocol;
pub mod session;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::engine::AuctionEngine;

pub use connections::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use protocol::{ClientCommand, ServerEvent};

/// Routes exposed by the gateway: the socket upgrade and a health probe
pub fn router(engine: Arc<AuctionEngine>) -> Router {
    Router::new()
        .route("/ws", get(session::ws_handler))
        .route("/healthz", get(health))
        .with_state(engine)
}

async fn health(State(engine): State<Arc<AuctionEngine>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "running_auctions": engine.active_auctions(),
        "connections": engine.connections().connection_count(),
    }))
}
