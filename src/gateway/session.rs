//! Client Sessions
//!
//! One task per WebSocket connection. The credential is verified before
//! the upgrade; after that the session shuttles outbound events from the
//! connection queue to the socket and inbound frames to the engine, with
//! the authenticated identity stamped on every command.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::AuctionEngine;
use crate::error::RejectCode;

use super::connections::ConnectionHandle;
use super::protocol::{ClientCommand, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: String,
}

/// `GET /ws?token=...`: authenticate, then upgrade
pub async fn ws_handler(
    State(engine): State<Arc<AuctionEngine>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let throttle = engine.throttle();
    if !throttle.allows(peer.ip()) {
        return auth_failed_response(StatusCode::TOO_MANY_REQUESTS, "locked out");
    }

    match engine.verifier().verify(&query.token).await {
        Ok(identity) => {
            throttle.record_success(peer.ip());
            ws.on_upgrade(move |socket| run_session(engine, identity, socket))
        }
        Err(error) => {
            debug!(%peer, %error, "credential rejected");
            throttle.record_failure(peer.ip());
            auth_failed_response(StatusCode::UNAUTHORIZED, &error.to_string())
        }
    }
}

fn auth_failed_response(status: StatusCode, detail: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": RejectCode::AuthFailed,
            "detail": detail,
        })),
    )
        .into_response()
}

async fn run_session(
    engine: Arc<AuctionEngine>,
    identity: crate::auth::Identity,
    socket: WebSocket,
) {
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerEvent>(engine.settings().engine.outbound_buffer);
    let connection =
        ConnectionHandle::new(identity.user_id, identity.username.clone(), outbound_tx);
    engine.connections().register(connection.clone());
    info!(user = %identity.username, connection = %connection.id, "session opened");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            Some(event) = outbound_rx.recv() => {
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(raw))) => {
                        match serde_json::from_str::<ClientCommand>(&raw) {
                            Ok(command) => {
                                engine.handle_command(&identity, &connection, command).await;
                            }
                            Err(error) => {
                                connection.send(ServerEvent::Error {
                                    message: format!("malformed command: {error}"),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // pings are answered by the transport; binary is ignored
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    engine.disconnect(&connection);
    info!(user = %identity.username, connection = %connection.id, "session closed");
}
