//! WebSocket handler for real-time event streaming.
//!
//! Clients pick a scope with `?scope=all|pipeline:<id>|run:<id>` and receive
//! every matching event as a JSON text frame, in publish order. A client that
//! falls too far behind is disconnected with a close frame.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::StreamExt;
use serde::Deserialize;
use sluice_core::events::SubscriptionScope;
use sluice_core::ports::EventStream;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeParams {
    #[serde(default)]
    pub scope: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<SubscribeParams>,
) -> Result<Response, ApiError> {
    let scope: SubscriptionScope = params.scope.as_deref().unwrap_or("all").parse()?;
    // Subscribe before upgrading so no event published after the handshake is missed.
    let events = state.scheduler.subscribe(scope.clone()).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, events, scope)))
}

async fn handle_socket(mut socket: WebSocket, mut events: EventStream, scope: SubscriptionScope) {
    debug!(scope = %scope, "Subscriber connected");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "subscriber fell behind".into(),
                        })))
                        .await;
                    warn!(scope = %scope, "Disconnected lagging subscriber");
                    break;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!(scope = %scope, "Subscriber disconnected");
}
