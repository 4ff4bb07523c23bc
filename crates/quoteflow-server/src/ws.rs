//! WebSocket transport for the subscription broadcaster.
//!
//! Endpoint: `GET /ws`. Each socket is registered with the broadcaster before
//! the upgrade completes, so a full server answers `503` instead of
//! accepting and immediately closing.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use quoteflow_core::{
    BroadcastError, Broadcaster, ConnectionId, ConnectionMetadata, Delivery, DisconnectReason,
    ServerMessage,
};
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::server::AppState;

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let metadata = connection_metadata(&headers);
    let hub = state.broadcaster.clone();

    let (id, outbound) = match hub.connect(metadata) {
        Ok(pair) => pair,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let failed_hub = hub.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::debug!(connection_id = %id, error = %e, "WebSocket upgrade failed");
        failed_hub.disconnect(id, DisconnectReason::TransportError);
    })
    .on_upgrade(move |socket| handle_socket(socket, hub, id, outbound))
}

fn connection_metadata(headers: &HeaderMap) -> ConnectionMetadata {
    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ConnectionMetadata {
        origin: header_value(header::ORIGIN),
        remote_addr: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string()),
        user_agent: header_value(header::USER_AGENT),
    }
}

/// Pump frames between the socket and the broadcaster until either side
/// closes.
async fn handle_socket(
    socket: WebSocket,
    hub: Arc<Broadcaster>,
    id: ConnectionId,
    mut outbound: mpsc::Receiver<Delivery>,
) {
    tracing::debug!(connection_id = %id, "WebSocket connection established");
    let (mut sender, mut receiver) = socket.split();

    // `None` when the broadcaster already dropped the connection.
    let reason = loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match hub.handle_message(id, text.as_str()).await {
                        Ok(()) => {}
                        Err(BroadcastError::NotConnected(_)) => break None,
                        Err(e) => {
                            tracing::debug!(connection_id = %id, error = %e, "Client message rejected");
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let _ = hub.send_to(id, ServerMessage::error("binary frames are not supported"));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    if !hub.touch(id) {
                        break None;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(connection_id = %id, "Client closed WebSocket");
                    break Some(DisconnectReason::ClientClosed);
                }
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %id, error = %e, "WebSocket receive error");
                    break Some(DisconnectReason::TransportError);
                }
            },
            delivery = outbound.recv() => match delivery {
                Some(Delivery::Message(message)) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(connection_id = %id, kind = message.kind(), error = %e, "Failed to serialize message");
                            continue;
                        }
                    };
                    if let Err(e) = sender.send(Message::Text(text.into())).await {
                        tracing::debug!(connection_id = %id, error = %e, "WebSocket send error");
                        break Some(DisconnectReason::TransportError);
                    }
                }
                Some(Delivery::Close(reason)) => {
                    tracing::debug!(connection_id = %id, reason = %reason, "Closing WebSocket");
                    let _ = sender.send(Message::Close(None)).await;
                    break None;
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break None;
                }
            },
        }
    };

    if let Some(reason) = reason {
        hub.disconnect(id, reason);
    }
}
