//! Maps protocol requests onto the session manager.

use std::sync::Arc;

use foldback_core::{NewEntry, SessionEvent, SessionId, SessionStorage};
use foldback_session::{ManagerError, SessionManager};
use futures::{StreamExt, stream::BoxStream};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol::{ClientMessage, Payload, Request, ServerMessage, WireEntry};

/// Executes requests against a shared [`SessionManager`].
pub struct Dispatcher<S>
where
    S: SessionStorage,
{
    manager: Arc<SessionManager<S>>,
}

impl<S> Clone for Dispatcher<S>
where
    S: SessionStorage,
{
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<S> Dispatcher<S>
where
    S: SessionStorage + 'static,
{
    #[must_use]
    pub const fn new(manager: Arc<SessionManager<S>>) -> Self {
        Self { manager }
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<SessionManager<S>> {
        &self.manager
    }

    /// Handle one message and build the reply.
    pub async fn handle(&self, msg: ClientMessage) -> ServerMessage {
        let ClientMessage {
            request_id,
            request,
        } = msg;
        if request == Request::Ping {
            return ServerMessage::Pong { request_id };
        }

        match self.dispatch(request).await {
            Ok(payload) => ServerMessage::ok(request_id, payload),
            Err(e) => {
                tracing::warn!("Request {request_id} rejected: {e}");
                ServerMessage::error(request_id, e.code(), e.to_string())
            }
        }
    }

    /// Run one request.
    ///
    /// `subscribe` and `ping` are connection concerns and succeed here
    /// without side effects.
    ///
    /// # Errors
    /// Returns the manager's error for the operation.
    pub async fn dispatch(&self, request: Request) -> Result<Payload, ManagerError> {
        let manager = &self.manager;
        Ok(match request {
            Request::CreateRoot => Payload::Created {
                session_id: manager.create_root().await?,
            },
            Request::Append {
                session_id,
                role,
                content,
            } => Payload::Appended {
                sequence: manager
                    .append(session_id, NewEntry::new(role, content))
                    .await?,
            },
            Request::Checkpoint { session_id } => {
                let checkpoint = manager.checkpoint(session_id).await?;
                Payload::Checkpoint {
                    checkpoint_id: checkpoint.id,
                    sequence: checkpoint.position,
                }
            }
            Request::SpawnChild { session_id } => Payload::Spawned {
                child_id: manager.spawn_child(session_id).await?,
            },
            Request::Revert {
                session_id,
                checkpoint_id,
                folded_message,
            } => Payload::Reverted(
                manager
                    .revert(session_id, checkpoint_id, folded_message)
                    .await?
                    .into(),
            ),
            Request::StageRevert {
                session_id,
                checkpoint_id,
                folded_message,
            } => {
                manager
                    .stage_revert(session_id, checkpoint_id, folded_message)
                    .await?;
                Payload::Staged
            }
            Request::ApplyStagedRevert { session_id } => Payload::StagedApplied {
                outcome: manager
                    .apply_staged_revert(session_id)
                    .await?
                    .map(Into::into),
            },
            Request::Complete { session_id } => Payload::Completed {
                entry: WireEntry::from(&manager.complete(session_id).await?),
            },
            Request::GetLog { session_id, from } => Payload::Log {
                entries: manager
                    .entries_from(session_id, from)
                    .await?
                    .iter()
                    .map(WireEntry::from)
                    .collect(),
            },
            Request::Snapshot { session_id } => {
                Payload::Snapshot(manager.snapshot(session_id).await?.into())
            }
            Request::ListSessions => Payload::Sessions {
                sessions: manager.sessions().await,
            },
            Request::Subscribe { .. } | Request::Ping => Payload::Subscribed,
        })
    }

    /// Event stream for a subscription. Live events are captured from the
    /// moment this returns.
    #[must_use]
    pub fn subscribe(
        &self,
        session: Option<SessionId>,
        replay: bool,
    ) -> BoxStream<'static, SessionEvent> {
        let events = self.manager.events();
        let stream = if replay {
            events
                .history_plus_stream()
                .filter_map(|res| futures::future::ready(res.ok()))
                .boxed()
        } else {
            events.live_stream()
        };
        match session {
            Some(session) => stream
                .filter(move |e| futures::future::ready(e.concerns(session)))
                .boxed(),
            None => stream,
        }
    }
}

/// One client connection: replies and an optional event subscription,
/// all written to the same outgoing channel.
pub struct Connection<S>
where
    S: SessionStorage,
{
    dispatcher: Dispatcher<S>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    subscription: Option<JoinHandle<()>>,
}

impl<S> Connection<S>
where
    S: SessionStorage + 'static,
{
    #[must_use]
    pub const fn new(dispatcher: Dispatcher<S>, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            dispatcher,
            tx,
            subscription: None,
        }
    }

    /// Handle one client message.
    ///
    /// Returns false once the outgoing channel is closed.
    pub async fn handle(&mut self, msg: ClientMessage) -> bool {
        let reply = match msg.request {
            Request::Subscribe { session_id, replay } => {
                self.subscribe(session_id, replay);
                ServerMessage::ok(msg.request_id, Payload::Subscribed)
            }
            _ => self.dispatcher.handle(msg).await,
        };
        self.tx.send(reply).is_ok()
    }

    /// Report a frame that failed to parse.
    pub fn reject(&self, message: impl Into<String>) -> bool {
        self.tx
            .send(ServerMessage::Error {
                code: "invalid_message".into(),
                message: message.into(),
            })
            .is_ok()
    }

    fn subscribe(&mut self, session: Option<SessionId>, replay: bool) {
        if let Some(previous) = self.subscription.take() {
            previous.abort();
        }
        let mut stream = self.dispatcher.subscribe(session, replay);
        let tx = self.tx.clone();
        self.subscription = Some(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if tx.send(ServerMessage::Event { event }).is_err() {
                    break;
                }
            }
        }));
    }
}

impl<S> Drop for Connection<S>
where
    S: SessionStorage,
{
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.abort();
        }
    }
}
