//! Broadcast + history event store for reconnection support.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{SessionEvent, config::EngineConfig, traits::SessionId};

#[derive(Clone)]
struct StoredEvent {
    event: SessionEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
}

/// Event store with broadcast and history support.
///
/// Mirrors connect late: they receive history first, then switch to live
/// updates without a gap.
pub struct EventStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionEvent>,
    history_limit: usize,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Create an event store with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    /// Create an event store sized from configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let (sender, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            history_limit: config.event_history_bytes,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: SessionEvent) {
        let _ = self.sender.send(event.clone()); // live listeners
        let bytes = event.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > self.history_limit {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredEvent { event, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Push several events in order.
    pub fn extend(&self, events: impl IntoIterator<Item = SessionEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<SessionEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.event.clone())
            .collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<SessionEvent, std::io::Error>> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history.into_iter().map(Ok::<_, std::io::Error>));
        let live = BroadcastStream::new(rx).filter_map(|res: Result<SessionEvent, _>| async move {
            match res {
                Ok(event) => Some(Ok::<_, std::io::Error>(event)),
                Err(e) => {
                    tracing::warn!("Event subscriber lagged: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }

    /// Stream of events concerning one session (history, then live).
    ///
    /// Child lifecycle events are included for both the parent and the child.
    #[must_use]
    pub fn session_stream(
        &self,
        session: SessionId,
    ) -> futures::stream::BoxStream<'static, Result<SessionEvent, std::io::Error>> {
        self.history_plus_stream()
            .filter(move |res| {
                futures::future::ready(res.as_ref().map_or(true, |e| e.concerns(session)))
            })
            .boxed()
    }

    /// Live events only, starting now.
    #[must_use]
    pub fn live_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        BroadcastStream::new(self.get_receiver())
            .filter_map(|res| async move {
                match res {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::warn!("Event subscriber lagged: {e}");
                        None
                    }
                }
            })
            .boxed()
    }

    /// SSE stream (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn sse_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<axum::response::sse::Event, std::io::Error>>
    {
        use futures::TryStreamExt;
        self.history_plus_stream()
            .map_ok(|e| e.to_sse_event())
            .boxed()
    }
}
