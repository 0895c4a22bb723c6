//! Bounded channel primitives connecting bridges to application instances.

pub mod conduit;
pub mod reply;

pub use conduit::{conduit, ChannelRegistry, ConduitReceiver, ConduitSender, RecvError, SendError};
pub use reply::ReplySlot;
