//! Named bounded conduits.
//!
//! A conduit is a bounded FIFO channel with a name attached for logging and
//! error reporting.  Sends never block: a full conduit reports
//! [`SendError::Full`] immediately and the caller decides whether to retry,
//! back off, or fail the request.  Receives optionally carry a timeout so no
//! consumer waits past its deadline.
//!
//! Each conduit has a single writer and a single reader by convention; the
//! types do not enforce it, the bridge's ownership structure does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a non-blocking send did not enqueue its message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The conduit is at capacity.  Recoverable; callers retry with backoff
    /// or surface backpressure to the peer.
    #[error("channel {0} is at capacity")]
    Full(String),

    /// The receiver is gone.  Terminal for this conduit.
    #[error("channel {0} is closed")]
    Closed(String),
}

/// Why a receive completed without a message.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RecvError {
    /// The configured wait elapsed.
    #[error("timed out waiting for a message")]
    Timeout,

    /// The wait was resolved externally during teardown.
    #[error("wait cancelled")]
    Cancelled,

    /// Every sender is gone and the queue is drained.
    #[error("channel closed")]
    Closed,
}

// ── Conduit ───────────────────────────────────────────────────────────────────

/// Sending half of a conduit.  Cheap to clone.
#[derive(Debug)]
pub struct ConduitSender<T> {
    name: Arc<str>,
    tx: mpsc::Sender<T>,
    capacity: usize,
}

// Manual impl: the handle is clonable for any T, a derive would demand
// T: Clone.
impl<T> Clone for ConduitSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

/// Receiving half of a conduit.
#[derive(Debug)]
pub struct ConduitReceiver<T> {
    name: Arc<str>,
    rx: mpsc::Receiver<T>,
}

/// Creates a named bounded conduit.
///
/// Capacity 0 is legal and produces a conduit on which every send fails with
/// [`SendError::Full`], which forces the backpressure path deterministically.
pub fn conduit<T>(name: &str, capacity: usize) -> (ConduitSender<T>, ConduitReceiver<T>) {
    let name: Arc<str> = Arc::from(name);
    // tokio's mpsc rejects a zero capacity, so a capacity-0 conduit is backed
    // by a channel that is never sent on.
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ConduitSender {
            name: Arc::clone(&name),
            tx,
            capacity,
        },
        ConduitReceiver { name, rx },
    )
}

impl<T> ConduitSender<T> {
    /// Enqueues one message without blocking.
    ///
    /// # Errors
    ///
    /// [`SendError::Full`] when the conduit is at capacity,
    /// [`SendError::Closed`] when the receiver has been dropped.  The message
    /// is consumed either way; callers that retry keep their own copy.
    pub fn send(&self, msg: T) -> Result<(), SendError> {
        if self.capacity == 0 {
            return Err(SendError::Full(self.name.to_string()));
        }
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::Full(self.name.to_string())),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed(self.name.to_string())),
        }
    }

    /// Sends with a bounded retry budget and linearly increasing delay.
    ///
    /// Attempt *i* (1-based) sleeps `base_delay * i` before retrying, so a
    /// budget of 3 with a 50 ms base waits 50 ms then 100 ms between the
    /// three attempts.  Only [`SendError::Full`] is retried; a closed conduit
    /// fails immediately.
    ///
    /// # Errors
    ///
    /// The last send error once the budget is exhausted.
    pub async fn send_with_retry(
        &self,
        msg: T,
        attempts: u32,
        base_delay: Duration,
    ) -> Result<(), SendError>
    where
        T: Clone,
    {
        let attempts = attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send(msg.clone()) {
                Ok(()) => return Ok(()),
                Err(err @ SendError::Closed(_)) => return Err(err),
                Err(err @ SendError::Full(_)) => {
                    if attempt >= attempts {
                        return Err(err);
                    }
                    debug!(
                        channel = %self.name,
                        attempt,
                        "conduit full, backing off before retry"
                    );
                    tokio::time::sleep(base_delay * attempt).await;
                }
            }
        }
    }

    /// The conduit's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> ConduitReceiver<T> {
    /// Receives the next message in push order.
    ///
    /// A `timeout` of `None` (or zero) waits indefinitely.
    ///
    /// # Errors
    ///
    /// [`RecvError::Timeout`] when the wait elapses, [`RecvError::Closed`]
    /// when every sender is gone and the queue is drained.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> Result<T, RecvError> {
        match timeout {
            Some(limit) if !limit.is_zero() => {
                match tokio::time::timeout(limit, self.rx.recv()).await {
                    Ok(Some(msg)) => Ok(msg),
                    Ok(None) => Err(RecvError::Closed),
                    Err(_) => Err(RecvError::Timeout),
                }
            }
            _ => self.rx.recv().await.ok_or(RecvError::Closed),
        }
    }

    /// The conduit's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Name-addressed conduit table.
///
/// For producers that only know a channel by name, such as scheduler jobs
/// posting to their reply channels.  Registering a name that already exists
/// replaces the previous conduit; the old receiver then reports `Closed`.
pub struct ChannelRegistry<T> {
    inner: Mutex<HashMap<String, ConduitSender<T>>>,
}

impl<T> ChannelRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a conduit under `name` and returns its receiving half.
    pub fn register(&self, name: &str, capacity: usize) -> ConduitReceiver<T> {
        let (tx, rx) = conduit(name, capacity);
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table.insert(name.to_string(), tx);
        rx
    }

    /// Sends to the conduit registered under `name`.
    ///
    /// # Errors
    ///
    /// [`SendError::Closed`] for an unknown name, otherwise whatever the
    /// underlying send reports.
    pub fn send(&self, name: &str, msg: T) -> Result<(), SendError> {
        let sender = {
            let table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            table.get(name).cloned()
        };
        match sender {
            Some(tx) => tx.send(msg),
            None => Err(SendError::Closed(name.to_string())),
        }
    }

    /// Forgets the conduit registered under `name`, if any.
    pub fn remove(&self, name: &str) {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table.remove(name);
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        let table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table.contains_key(name)
    }
}

impl<T> Default for ChannelRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_then_recv_preserves_fifo_order() {
        let (tx, mut rx) = conduit::<u32>("test.fifo", 8);

        tx.send(1).expect("send 1");
        tx.send(2).expect("send 2");
        tx.send(3).expect("send 3");

        assert_eq!(rx.recv(None).await, Ok(1));
        assert_eq!(rx.recv(None).await, Ok(2));
        assert_eq!(rx.recv(None).await, Ok(3));
    }

    #[tokio::test]
    async fn test_send_reports_full_at_capacity() {
        let (tx, _rx) = conduit::<u32>("test.full", 2);

        tx.send(1).expect("send 1");
        tx.send(2).expect("send 2");

        assert_eq!(tx.send(3), Err(SendError::Full("test.full".to_string())));
    }

    #[tokio::test]
    async fn test_capacity_zero_always_reports_full() {
        let (tx, _rx) = conduit::<u32>("test.zero", 0);

        assert_eq!(tx.send(1), Err(SendError::Full("test.zero".to_string())));
        assert_eq!(tx.send(2), Err(SendError::Full("test.zero".to_string())));
    }

    #[tokio::test]
    async fn test_sender_clones_without_a_clone_payload() {
        struct Opaque(u32);

        let (tx, mut rx) = conduit::<Opaque>("test.opaque", 2);
        let tx2 = tx.clone();
        tx2.send(Opaque(9)).expect("send via clone");
        assert_eq!(rx.recv(None).await.map(|m| m.0), Ok(9));

        // The registry path clones internally and must not demand T: Clone.
        let registry = ChannelRegistry::<Opaque>::new();
        let mut reg_rx = registry.register("schedule.opaque", 2);
        registry
            .send("schedule.opaque", Opaque(7))
            .expect("registry send");
        assert_eq!(reg_rx.recv(None).await.map(|m| m.0), Ok(7));
    }

    #[tokio::test]
    async fn test_send_reports_closed_after_receiver_drop() {
        let (tx, rx) = conduit::<u32>("test.closed", 2);
        drop(rx);

        assert_eq!(tx.send(1), Err(SendError::Closed("test.closed".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_times_out_when_no_message_arrives() {
        let (_tx, mut rx) = conduit::<u32>("test.timeout", 2);

        let result = rx.recv(Some(Duration::from_millis(100))).await;
        assert_eq!(result, Err(RecvError::Timeout));
    }

    #[tokio::test]
    async fn test_recv_reports_closed_after_queue_drained() {
        let (tx, mut rx) = conduit::<u32>("test.drain", 2);
        tx.send(7).expect("send");
        drop(tx);

        // Queued message is still delivered, then the conduit is closed.
        assert_eq!(rx.recv(None).await, Ok(7));
        assert_eq!(rx.recv(None).await, Err(RecvError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_with_retry_succeeds_once_space_frees_up() {
        let (tx, mut rx) = conduit::<u32>("test.retry", 1);
        tx.send(1).expect("fill");

        // Drain the conduit shortly after the first failed attempt, keeping
        // the receiver alive until the retried send has landed.
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let drained = rx.recv(None).await.expect("drain");
            (drained, rx)
        });

        tx.send_with_retry(2, 3, Duration::from_millis(50))
            .await
            .expect("retry must succeed after the drain");

        let (drained, mut rx) = drain.await.expect("join");
        assert_eq!(drained, 1);
        assert_eq!(rx.recv(None).await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_with_retry_exhausts_budget_on_saturated_conduit() {
        let (tx, _rx) = conduit::<u32>("test.exhaust", 0);

        let start = tokio::time::Instant::now();
        let result = tx.send_with_retry(1, 3, Duration::from_millis(50)).await;

        assert_eq!(result, Err(SendError::Full("test.exhaust".to_string())));
        // Two backoff sleeps: 50 ms then 100 ms.
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_registry_routes_by_name() {
        let registry = ChannelRegistry::<u32>::new();
        let mut rx = registry.register("schedule.reply", 4);

        registry.send("schedule.reply", 42).expect("send");
        assert_eq!(rx.recv(None).await, Ok(42));

        assert_eq!(
            registry.send("schedule.unknown", 1),
            Err(SendError::Closed("schedule.unknown".to_string()))
        );
    }

    #[tokio::test]
    async fn test_registry_remove_forgets_channel() {
        let registry = ChannelRegistry::<u32>::new();
        let _rx = registry.register("schedule.gone", 4);
        assert!(registry.contains("schedule.gone"));

        registry.remove("schedule.gone");
        assert!(!registry.contains("schedule.gone"));
        assert!(registry.send("schedule.gone", 1).is_err());
    }
}
