//! Message protocol spoken between the socket-facing bridges and
//! application instances.

pub mod messages;
pub mod scope;
pub mod sequence;

pub use messages::{BridgeMessage, WsFrame};
pub use scope::{Scope, ScopeKind};
pub use sequence::SequenceCounter;
