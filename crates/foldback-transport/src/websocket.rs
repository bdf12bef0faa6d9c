//! WebSocket transport for remote planners and mirrors.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use foldback_core::SessionStorage;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::{
    dispatch::{Connection, Dispatcher},
    protocol::{ClientMessage, ServerMessage},
};

/// WebSocket handler state.
pub struct WsState<S>
where
    S: SessionStorage,
{
    /// Request dispatcher shared by every socket.
    pub dispatcher: Dispatcher<S>,
}

impl<S> Clone for WsState<S>
where
    S: SessionStorage,
{
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<S> WsState<S>
where
    S: SessionStorage,
{
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(dispatcher: Dispatcher<S>) -> Self {
        Self { dispatcher }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler<S>(
    ws: WebSocketUpgrade,
    State(state): State<WsState<S>>,
) -> impl IntoResponse
where
    S: SessionStorage + 'static,
{
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket<S>(socket: WebSocket, state: WsState<S>)
where
    S: SessionStorage + 'static,
{
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(state.dispatcher, tx);

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                if !connection.reject(format!("Invalid message: {e}")) {
                    break;
                }
                continue;
            }
        };

        if !connection.handle(client_msg).await {
            break;
        }
    }

    drop(connection);
    send_task.abort();
    tracing::debug!("WebSocket client disconnected");
}

/// Create WebSocket router serving `/ws`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(dispatcher));
/// ```
#[must_use]
pub fn create_ws_router<S>(dispatcher: Dispatcher<S>) -> axum::Router
where
    S: SessionStorage + 'static,
{
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(WsState::new(dispatcher))
}
