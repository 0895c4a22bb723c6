//! # bridge-server
//!
//! The bridge itself: accepts HTTP and WebSocket connections, translates
//! socket events into [`bridge_core::BridgeMessage`] traffic, and relays the
//! application's replies back onto the wire.
//!
//! # Layer structure
//!
//! - **`domain`** – [`BridgeConfig`](domain::BridgeConfig): every runtime
//!   knob as a plain struct, built from CLI args, an optional TOML file, or
//!   defaults.
//! - **`application`** – the backend seam.  [`Backend`](application::Backend)
//!   normalizes the two application calling conventions;
//!   [`ApplicationManager`](application::ApplicationManager) owns one task
//!   per live connection; the [`scheduler`](application::scheduler) posts
//!   timer-triggered messages to named channels.
//! - **`infrastructure`** – the socket-facing machinery: accept loop,
//!   dispatch front, the per-request HTTP state machine, the per-connection
//!   WebSocket state machine, and the conditional static-file responder.

pub mod application;
pub mod domain;
pub mod infrastructure;
