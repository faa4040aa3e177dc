//! WebSocket handler for live monitoring results

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, stream::StreamExt};
use tracing::{debug, info, warn};

use crate::api::state::ApiState;

/// WebSocket upgrade handler
///
/// GET /ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

/// Forward hub messages to one client until either side goes away
async fn handle_websocket(socket: WebSocket, state: ApiState) {
    let subscription = match state.hub.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("could not subscribe WebSocket client: {e}");
            return;
        }
    };
    let id = subscription.id;
    let mut results = subscription.receiver;

    info!("WebSocket client {id} connected");

    let (mut sender, mut receiver) = socket.split();

    let shutdown = state.shutdown.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                message = results.recv() => {
                    let Some(text) = message else {
                        debug!("hub closed subscription");
                        break;
                    };

                    if sender.send(Message::Text(text)).await.is_err() {
                        debug!("WebSocket send failed, client disconnected");
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    state.hub.unsubscribe(id).await;
    info!("WebSocket client {id} disconnected");
}
