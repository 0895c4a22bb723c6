//! Single-slot reply conduit.
//!
//! Each connection owns one [`ReplySlot`]: the application instance pushes
//! outbound messages into it and the bridge's reply loop takes them one at a
//! time.  The slot deliberately holds at most one message.  If the
//! application produces a second message before the bridge has taken the
//! first, the new message is dropped with a warning; the bridges' loops
//! always consume before acting, so a drop here surfaces an application that
//! is replying out of protocol rather than silently queueing its mistake.
//!
//! At most one receiver waits at a time.  `recv` atomically takes the value
//! and leaves the slot empty, so a later wait can never observe a stale
//! message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::channel::conduit::RecvError;
use crate::protocol::messages::BridgeMessage;

enum SlotState {
    Empty,
    Occupied(BridgeMessage),
    Cancelled,
}

struct Shared {
    state: Mutex<SlotState>,
    notify: Notify,
}

/// Cloneable handle to a connection's single-slot reply conduit.
#[derive(Clone)]
pub struct ReplySlot {
    shared: Arc<Shared>,
}

impl ReplySlot {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SlotState::Empty),
                notify: Notify::new(),
            }),
        }
    }

    /// Places `msg` into the slot if it is empty.
    ///
    /// Returns `false` when the message was dropped because the slot was
    /// still occupied or the connection was already cancelled.
    pub async fn send(&self, msg: BridgeMessage) -> bool {
        let mut state = self.shared.state.lock().await;
        match *state {
            SlotState::Empty => {
                *state = SlotState::Occupied(msg);
                drop(state);
                self.shared.notify.notify_one();
                true
            }
            SlotState::Occupied(ref pending) => {
                warn!(
                    pending = pending.kind(),
                    dropped = msg.kind(),
                    "reply slot still occupied, dropping new message"
                );
                false
            }
            SlotState::Cancelled => {
                debug!(
                    dropped = msg.kind(),
                    "reply slot cancelled, dropping message"
                );
                false
            }
        }
    }

    /// Waits for a message, takes it, and leaves the slot empty.
    ///
    /// A `timeout` of `None` (or zero) waits indefinitely.
    ///
    /// # Errors
    ///
    /// [`RecvError::Timeout`] when the wait elapses,
    /// [`RecvError::Cancelled`] once [`cancel`](ReplySlot::cancel) has run.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<BridgeMessage, RecvError> {
        match timeout {
            Some(limit) if !limit.is_zero() => {
                match tokio::time::timeout(limit, self.wait_for_value()).await {
                    Ok(result) => result,
                    Err(_) => Err(RecvError::Timeout),
                }
            }
            _ => self.wait_for_value().await,
        }
    }

    /// Resolves any pending receive with [`RecvError::Cancelled`].
    ///
    /// Sticky: every receive after cancellation fails fast, and any message
    /// still sitting in the slot is discarded.
    pub async fn cancel(&self) {
        let mut state = self.shared.state.lock().await;
        *state = SlotState::Cancelled;
        drop(state);
        self.shared.notify.notify_one();
    }

    async fn wait_for_value(&self) -> Result<BridgeMessage, RecvError> {
        loop {
            {
                let mut state = self.shared.state.lock().await;
                match std::mem::replace(&mut *state, SlotState::Empty) {
                    SlotState::Occupied(msg) => return Ok(msg),
                    SlotState::Cancelled => {
                        *state = SlotState::Cancelled;
                        return Err(RecvError::Cancelled);
                    }
                    SlotState::Empty => {}
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

impl Default for ReplySlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close_msg() -> BridgeMessage {
        BridgeMessage::WsClose { code: None }
    }

    fn accept_msg() -> BridgeMessage {
        BridgeMessage::WsAccept { subprotocol: None }
    }

    #[tokio::test]
    async fn test_send_then_recv_takes_and_resets() {
        let slot = ReplySlot::new();

        assert!(slot.send(accept_msg()).await);
        assert_eq!(slot.recv(None).await, Ok(accept_msg()));

        // The slot is empty again, so a new message is stored, not dropped.
        assert!(slot.send(close_msg()).await);
        assert_eq!(slot.recv(None).await, Ok(close_msg()));
    }

    #[tokio::test]
    async fn test_second_unread_message_is_dropped() {
        let slot = ReplySlot::new();

        assert!(slot.send(accept_msg()).await);
        assert!(
            !slot.send(close_msg()).await,
            "second message must be dropped while the first is unread"
        );

        // The first message survives the drop.
        assert_eq!(slot.recv(None).await, Ok(accept_msg()));
    }

    #[tokio::test]
    async fn test_recv_wakes_pending_waiter() {
        let slot = ReplySlot::new();
        let producer = slot.clone();

        let waiter = tokio::spawn(async move { slot.recv(Some(Duration::from_secs(5))).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(producer.send(accept_msg()).await);

        assert_eq!(waiter.await.expect("join"), Ok(accept_msg()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_times_out_without_message() {
        let slot = ReplySlot::new();

        let result = slot.recv(Some(Duration::from_millis(100))).await;
        assert_eq!(result, Err(RecvError::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_resolves_pending_wait_and_sticks() {
        let slot = ReplySlot::new();
        let canceller = slot.clone();

        let waiter = tokio::spawn(async move { slot.recv(Some(Duration::from_secs(5))).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel().await;

        assert_eq!(waiter.await.expect("join"), Err(RecvError::Cancelled));
        // Sticky: later receives and sends fail fast.
        assert_eq!(canceller.recv(None).await, Err(RecvError::Cancelled));
        assert!(!canceller.send(accept_msg()).await);
    }
}
