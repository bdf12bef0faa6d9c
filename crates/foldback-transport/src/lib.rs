//! Transport layer for foldback sessions.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - `Dispatcher` - Maps requests onto the session manager
//! - In-process channel transport
//! - WebSocket transport (feature: websocket)

pub mod channel;
pub mod dispatch;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{ChannelClient, ChannelServer, SendError};
pub use dispatch::{Connection, Dispatcher};
pub use protocol::{ClientMessage, Outcome, Payload, Request, ServerMessage};
