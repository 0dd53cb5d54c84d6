//! Signaling websocket.
//!
//! One reader and one writer per connection. The reader decodes and
//! dispatches frames strictly in arrival order; the writer drains the
//! session's bounded outbox. Either side closing ends the session.

use crate::routes::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use call_protocol::{decode_client, encode};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbox, mut events) = mpsc::channel(state.outbox_capacity);
    let dispatcher = state.dispatcher;
    let session_id = dispatcher.connect(outbox).await;

    info!(target: "cs.transport", session_id = %session_id, "Websocket session opened");

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match encode(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        target: "cs.transport",
                        session_id = %session_id,
                        error = %e,
                        "Dropping unencodable event"
                    );
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(
                    target: "cs.transport",
                    session_id = %session_id,
                    error = %e,
                    "Websocket read failed"
                );
                break;
            }
        };

        match decode_client(&text) {
            Ok(event) => dispatcher.handle(session_id, event).await,
            Err(e) => dispatcher.reject_malformed(session_id, &e).await,
        }
    }

    dispatcher.disconnect(session_id).await;
    writer.abort();

    info!(target: "cs.transport", session_id = %session_id, "Websocket session closed");
}
