//! Relay WebSocket route

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::features::shared::UserId;
use crate::sync::RequestRelay;

pub fn relay_routes() -> Router<RequestRelay> {
    Router::new().route("/ws", get(relay_socket))
}

/// GET /ws
async fn relay_socket(
    State(relay): State<RequestRelay>,
    user: UserId,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(relay, user.0, socket))
}

async fn serve_socket(relay: RequestRelay, user_id: Uuid, socket: WebSocket) {
    let (connection_id, mut outbound) = relay.register(user_id).await;
    info!(user_id = %user_id, connection_id = %connection_id, "Relay socket opened");

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    // Single writer: relay traffic and direct replies share the sink
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = outbound.recv() => frame,
                reply = reply_rx.recv() => reply,
            };
            // A closed outbound channel means this connection was replaced
            let Some(text) = frame else { break };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        if let Err(e) = sink.close().await {
            debug!(user_id = %user_id, error = %e, "Relay socket close failed");
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Some(reply) = relay.handle_inbound(user_id, connection_id, &text).await {
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {},
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "Relay socket error");
                break;
            },
        }
    }

    relay.unregister(user_id, connection_id).await;
    writer.abort();
    info!(user_id = %user_id, connection_id = %connection_id, "Relay socket closed");
}
