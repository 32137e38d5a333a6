//! WebSocket endpoint
//!
//! One reader loop drives the connection state machine; one writer task
//! drains the bounded outbound channel into the socket.

use crate::connection::{Connection, Inbound};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use hal_common::protocol::ServerMessage;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

/// How long the writer may keep flushing after the reader has stopped
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upgrade to a WebSocket and run the connection until it closes
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let connections = state.connections.clone();
    ws.on_upgrade(move |socket| connections.track_future(handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    let span = info_span!("connection", %connection_id);

    async move {
        info!("Client connected");

        let (mut ws_sender, ws_receiver) = socket.split();
        let buffer = state.config.server.outbound_buffer.max(1);
        let (tx, mut rx) = mpsc::channel::<ServerMessage>(buffer);

        let connection = match Connection::new(state, tx) {
            Ok(connection) => connection,
            Err(e) => {
                e.log();
                return;
            }
        };

        let mut send_task = tokio::spawn(
            async move {
                while let Some(message) = rx.recv().await {
                    let json = match message.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            e.log();
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("Socket write failed, stopping writer");
                        break;
                    }
                }
                let _ = ws_sender.send(Message::Close(None)).await;
            }
            .in_current_span(),
        );

        let frames = ws_receiver.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(Inbound::Text(text.as_str().to_owned())),
                Ok(Message::Close(_)) => Some(Inbound::Close),
                Ok(_) => None,
                Err(e) => {
                    debug!(error = %e, "Socket read failed");
                    Some(Inbound::Close)
                }
            }
        });

        connection.run(Box::pin(frames)).await;

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
            send_task.abort();
        }
        info!("Client disconnected");
    }
    .instrument(span)
    .await
}
