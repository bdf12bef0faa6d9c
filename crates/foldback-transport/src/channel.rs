//! In-process transport over tokio channels.
//!
//! A [`ChannelClient`] talks to a [`ChannelServer`] through a pair of
//! unbounded mpsc channels carrying the same messages as the WebSocket
//! transport, without serialization.

use std::collections::VecDeque;

use foldback_core::{SessionEvent, SessionStorage};
use tokio::sync::mpsc;

use crate::{
    dispatch::{Connection, Dispatcher},
    protocol::{ClientMessage, Outcome, Request, RequestId, ServerMessage},
};

/// Client side of the channel transport.
pub struct ChannelClient {
    client_tx: mpsc::UnboundedSender<ClientMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    next_request_id: RequestId,
    /// Messages received while waiting for a specific response.
    backlog: VecDeque<ServerMessage>,
}

/// Server side of the channel transport.
pub struct ChannelServer {
    client_rx: mpsc::UnboundedReceiver<ClientMessage>,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Create a connected client/server pair.
#[must_use]
pub fn channel() -> (ChannelClient, ChannelServer) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();

    let client = ChannelClient {
        client_tx,
        server_rx,
        next_request_id: 1,
        backlog: VecDeque::new(),
    };

    let server = ChannelServer {
        client_rx,
        server_tx,
    };

    (client, server)
}

/// Spawn a server task for `dispatcher` and return the connected client.
#[must_use]
pub fn connect<S>(dispatcher: Dispatcher<S>) -> ChannelClient
where
    S: SessionStorage + 'static,
{
    let (client, server) = channel();
    tokio::spawn(server.serve(dispatcher));
    client
}

impl ChannelClient {
    /// Send a request and return its id.
    ///
    /// # Errors
    /// Returns error if the server is gone.
    pub fn send(&mut self, request: Request) -> Result<RequestId, SendError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.client_tx
            .send(ClientMessage::new(request_id, request))
            .map_err(|_| SendError::ChannelClosed)?;
        Ok(request_id)
    }

    /// Send a request and wait for its result.
    ///
    /// Events and other replies that arrive first are kept for [`Self::recv`].
    ///
    /// # Errors
    /// Returns error if the server is gone before replying.
    pub async fn request(&mut self, request: Request) -> Result<Outcome, SendError> {
        let request_id = self.send(request)?;
        loop {
            let msg = self
                .server_rx
                .recv()
                .await
                .ok_or(SendError::ChannelClosed)?;
            match msg {
                ServerMessage::Response {
                    request_id: id,
                    result,
                } if id == request_id => return Ok(result),
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Receive the next server message.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        if let Some(msg) = self.backlog.pop_front() {
            return Some(msg);
        }
        self.server_rx.recv().await
    }

    /// Receive the next event, skipping other messages.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let ServerMessage::Event { event } = self.recv().await? {
                return Some(event);
            }
        }
    }

    /// Receive a server message (non-blocking).
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.backlog
            .pop_front()
            .or_else(|| self.server_rx.try_recv().ok())
    }
}

impl ChannelServer {
    /// Serve requests until the client goes away.
    pub async fn serve<S>(self, dispatcher: Dispatcher<S>)
    where
        S: SessionStorage + 'static,
    {
        let Self {
            mut client_rx,
            server_tx,
        } = self;
        let mut connection = Connection::new(dispatcher, server_tx);

        while let Some(msg) = client_rx.recv().await {
            if !connection.handle(msg).await {
                break;
            }
        }
        tracing::debug!("Channel client disconnected");
    }
}

/// Send error.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;
    use foldback_core::{CheckpointId, Role};
    use foldback_session::{SessionManager, storage::MemoryStorage};

    use super::*;
    use crate::protocol::{Payload, WireEntry};

    fn client() -> ChannelClient {
        connect(Dispatcher::new(Arc::new(SessionManager::new(
            MemoryStorage::new(),
        ))))
    }

    async fn ok(client: &mut ChannelClient, request: Request) -> Payload {
        match client.request(request).await.unwrap() {
            Outcome::Ok(payload) => payload,
            Outcome::Error(body) => panic!("request failed: {} {}", body.code, body.message),
        }
    }

    async fn append(client: &mut ChannelClient, session_id: uuid::Uuid, text: &'static str) {
        ok(
            client,
            Request::Append {
                session_id,
                role: Role::User,
                content: Bytes::from_static(text.as_bytes()),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn test_revert_over_channel() {
        let mut client = client();
        let Payload::Created { session_id } = ok(&mut client, Request::CreateRoot).await else {
            panic!("expected created");
        };
        append(&mut client, session_id, "fix the bug").await;
        let Payload::Checkpoint { checkpoint_id, .. } =
            ok(&mut client, Request::Checkpoint { session_id }).await
        else {
            panic!("expected checkpoint");
        };
        append(&mut client, session_id, "20k lines").await;
        ok(
            &mut client,
            Request::Subscribe {
                session_id: Some(session_id),
                replay: false,
            },
        )
        .await;

        let Payload::Reverted(summary) = ok(
            &mut client,
            Request::Revert {
                session_id,
                checkpoint_id,
                folded_message: Bytes::from_static(b"fixed bug, no need to redo"),
            },
        )
        .await
        else {
            panic!("expected reverted");
        };
        assert_eq!(summary.fold_sequence, 4);

        let first = tokio::time::timeout(Duration::from_secs(1), client.next_event())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), client.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            SessionEvent::Reverted {
                session: session_id,
                checkpoint_id
            }
        );
        assert_eq!(
            second,
            SessionEvent::EntryAppended {
                session: session_id,
                sequence: 4,
                role: Role::Agent,
                content: Bytes::from_static(b"fixed bug, no need to redo"),
            }
        );

        let Payload::Log { entries } = ok(
            &mut client,
            Request::GetLog {
                session_id,
                from: 0,
            },
        )
        .await
        else {
            panic!("expected log");
        };
        let seqs: Vec<_> = entries.iter().map(|e: &WireEntry| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_stale_checkpoint_is_reported() {
        let mut client = client();
        let Payload::Created { session_id } = ok(&mut client, Request::CreateRoot).await else {
            panic!("expected created");
        };
        ok(&mut client, Request::Checkpoint { session_id }).await;
        append(&mut client, session_id, "step").await;
        ok(&mut client, Request::Checkpoint { session_id }).await;
        ok(
            &mut client,
            Request::Revert {
                session_id,
                checkpoint_id: CheckpointId(0),
                folded_message: Bytes::from_static(b"fold"),
            },
        )
        .await;

        let outcome = client
            .request(Request::Revert {
                session_id,
                checkpoint_id: CheckpointId(1),
                folded_message: Bytes::from_static(b"again"),
            })
            .await
            .unwrap();
        let Outcome::Error(body) = outcome else {
            panic!("expected error");
        };
        assert_eq!(body.code, "unknown_checkpoint");
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let mut client = client();
        let id = tokio_test::assert_ok!(client.send(Request::Ping));
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Pong { request_id: id })
        );
    }
}
