//! WebSocket bridge between a client and its `LiveSession`.
//!
//! Outgoing notifications go through a bounded channel drained by a sender
//! task, so the live loop never writes to the socket directly.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::AppState;
use crate::pipeline::{ClientMessage, LiveContext, LiveSession, Notification};

const SEND_BUFFER: usize = 32;

pub(super) async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let ctx = state.live.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: LiveContext) {
    let (ws_sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Notification>(SEND_BUFFER);

    let send_task = tokio::spawn(async move {
        let mut ws_sender = ws_sender;
        while let Some(note) = rx.recv().await {
            let text = match serde_json::to_string(&note) {
                Ok(text) => text,
                Err(err) => {
                    log::error!("failed to encode {} notification: {}", note.event_name(), err);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut session = match LiveSession::new(ctx, tx) {
        Ok(session) => session,
        Err(err) => {
            log::error!("cannot start live session: {:#}", err);
            send_task.abort();
            return;
        }
    };

    if session.connect().await.is_ok() {
        while let Some(incoming) = receiver.next().await {
            let text = match incoming {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    log::debug!("websocket receive failed: {}", err);
                    break;
                }
            };
            let message: ClientMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(err) => {
                    log::debug!("ignoring unrecognized client message: {}", err);
                    continue;
                }
            };
            if session.handle(message).await.is_err() {
                break;
            }
        }
    }

    session.shutdown().await;
    drop(session);
    let _ = send_task.await;
}
