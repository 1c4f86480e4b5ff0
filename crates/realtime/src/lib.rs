//! Realtime hub for notebook collaboration.
//!
//! Clients connect over WebSocket, subscribe to notebooks, and receive every
//! [`NotebookEvent`] published for those notebooks. Delivery is best-effort
//! and at-most-once: a slow or dead connection never blocks the others.
//!
//! # Features
//! - Per-notebook subscriptions with immediate acknowledgements
//! - Non-blocking fan-out through bounded per-connection queues
//! - Heartbeat loop that evicts connections silent for 2x the interval
//! - Presence notifications so collaborators can release a departed
//!   actor's resources

mod error;
mod hub;
mod protocol;
mod server;

pub use error::{HubError, Result};
pub use hub::{
    Command, ConnectionInfo, DisconnectReason, Hub, HubConfig, InboundHandler, Outbound,
    PresenceEvent, Registration,
};
pub use protocol::{ClientMessage, EventKind, NotebookEvent, ServerMessage};
pub use server::{bind, serve};
