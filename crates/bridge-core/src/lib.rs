//! # bridge-core
//!
//! Shared library for the channel bridge containing the message protocol,
//! per-connection scope metadata, and the bounded channel primitives that
//! connect socket-facing code to application instances.
//!
//! This crate is used by the bridge server and by anything that wants to
//! speak the bridge's message protocol in-process.  It has zero dependencies
//! on sockets, HTTP, or WebSocket framing.
//!
//! # Architecture overview
//!
//! The bridge translates socket-level events (HTTP requests, WebSocket
//! frames) into typed messages and relays them over bounded channels:
//!
//! - **`protocol`** – The message vocabulary.  [`BridgeMessage`] is a tagged
//!   enum with one variant per protocol event; [`Scope`] is the read-only
//!   per-connection metadata handed to each application instance;
//!   [`SequenceCounter`] produces the `order` tags that let a consumer
//!   reconstruct WebSocket event ordering.
//!
//! - **`channel`** – The plumbing.  A [`conduit`] is a named, bounded FIFO
//!   channel with non-blocking sends and timeout receives; a [`ReplySlot`] is
//!   the single-slot return path an application instance uses to answer its
//!   connection; a [`ChannelRegistry`] addresses conduits by name for
//!   consumers that never hold a sender directly.

pub mod channel;
pub mod protocol;

pub use channel::conduit::{
    conduit, ChannelRegistry, ConduitReceiver, ConduitSender, RecvError, SendError,
};
pub use channel::reply::ReplySlot;
pub use protocol::messages::{BridgeMessage, WsFrame};
pub use protocol::scope::{Scope, ScopeKind};
pub use protocol::sequence::SequenceCounter;
