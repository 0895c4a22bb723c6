//! Application instance lifecycle.
//!
//! The [`ApplicationManager`] owns exactly one tokio task per live
//! connection.  Bridges create an instance when a connection arrives, feed it
//! through the returned conduit sender, and call [`finish`] exactly once from
//! their finalize path; the manager makes `finish` idempotent so racing
//! teardown paths stay safe.
//!
//! [`finish`]: ApplicationManager::finish

use std::collections::HashMap;
use std::time::Duration;

use bridge_core::{conduit, BridgeMessage, ConduitSender, ReplySlot, Scope};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::backend::{Backend, CreationError};

/// Why an instance could not be created.
#[derive(Debug, Error)]
pub enum CreateError {
    /// The connection already has a live instance.
    #[error("connection {0} already has a live instance")]
    AlreadyLive(Uuid),

    /// The backend factory refused the scope.
    #[error(transparent)]
    Creation(#[from] CreationError),
}

/// One task per connection, with idempotent teardown.
pub struct ApplicationManager {
    backend: Backend,
    channel_capacity: usize,
    live: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl ApplicationManager {
    pub fn new(backend: Backend, channel_capacity: usize) -> Self {
        Self {
            backend,
            channel_capacity,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the instance for `conn_id`: binds the backend to `scope`,
    /// opens the inbound conduit, and spawns the instance task wired to emit
    /// replies into `reply`.
    ///
    /// Returns the conduit sender the bridge pushes protocol events into.
    ///
    /// # Errors
    ///
    /// [`CreateError::Creation`] when the backend refuses the scope (deny the
    /// handshake / fail the request), [`CreateError::AlreadyLive`] when the
    /// one-instance-per-connection invariant would be violated.
    pub async fn create_instance(
        &self,
        conn_id: Uuid,
        scope: Scope,
        reply: ReplySlot,
    ) -> Result<ConduitSender<BridgeMessage>, CreateError> {
        let instance = self.backend.bind(scope)?;

        let mut live = self.live.lock().await;
        if live.contains_key(&conn_id) {
            return Err(CreateError::AlreadyLive(conn_id));
        }

        let (tx, rx) = conduit(&format!("app.{conn_id}"), self.channel_capacity);
        let handle = tokio::spawn(instance(rx, reply));
        live.insert(conn_id, handle);
        debug!(%conn_id, live = live.len(), "application instance created");
        Ok(tx)
    }

    /// Finishes the instance for `conn_id`.
    ///
    /// Idempotent: the first call aborts the task if it is still running and
    /// removes it from the live set; later calls (and calls for unknown ids)
    /// are no-ops.  Returns whether a cancellation was issued.  Never waits
    /// for the task to settle; aggregated shutdown does that.
    pub async fn finish(&self, conn_id: Uuid) -> bool {
        let handle = self.live.lock().await.remove(&conn_id);
        match handle {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                debug!(%conn_id, "application instance cancelled");
                true
            }
            Some(_) => {
                debug!(%conn_id, "application instance already complete");
                false
            }
            None => false,
        }
    }

    /// Finishes the instance for `conn_id`, letting it run for up to `grace`
    /// before aborting.
    ///
    /// The instance leaves the live set immediately, but the task keeps
    /// running until it completes on its own or the grace period elapses.
    /// Teardown paths that have just pushed final messages use this so the
    /// instance gets a chance to drain them; a task that never yields is
    /// still cancelled.  Idempotent like [`finish`](ApplicationManager::finish).
    pub async fn finish_with_grace(&self, conn_id: Uuid, grace: Duration) -> bool {
        let handle = self.live.lock().await.remove(&conn_id);
        match handle {
            Some(mut handle) if !handle.is_finished() => {
                tokio::spawn(async move {
                    tokio::select! {
                        _ = &mut handle => {}
                        _ = tokio::time::sleep(grace) => {
                            handle.abort();
                            debug!(%conn_id, "application instance cancelled after grace period");
                        }
                    }
                });
                true
            }
            Some(_) => {
                debug!(%conn_id, "application instance already complete");
                false
            }
            None => false,
        }
    }

    /// Aborts every live instance and awaits settlement, swallowing
    /// cancellation errors.
    pub async fn stop_all(&self) {
        let drained: Vec<(Uuid, JoinHandle<()>)> = self.live.lock().await.drain().collect();
        for (conn_id, handle) in drained {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => warn!(%conn_id, "instance task failed during shutdown: {err}"),
            }
        }
    }

    /// Number of live instances.  Diagnostics and tests.
    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::ScopeKind;
    use std::time::Duration;

    fn test_scope() -> Scope {
        Scope::new(ScopeKind::Http, "/".into(), String::new(), String::new())
    }

    /// Backend whose instances run until aborted.
    fn pending_backend() -> Backend {
        Backend::direct(|_scope, _rx, _tx| async {
            std::future::pending::<()>().await;
        })
    }

    #[tokio::test]
    async fn test_create_then_finish_cancels_once() {
        let mgr = ApplicationManager::new(pending_backend(), 4);
        let conn_id = Uuid::new_v4();

        let _tx = mgr
            .create_instance(conn_id, test_scope(), ReplySlot::new())
            .await
            .expect("create");
        assert_eq!(mgr.live_count().await, 1);

        assert!(mgr.finish(conn_id).await, "first finish must cancel");
        assert_eq!(mgr.live_count().await, 0);
        assert!(!mgr.finish(conn_id).await, "second finish must be a no-op");
    }

    #[tokio::test]
    async fn test_finish_unknown_connection_is_noop() {
        let mgr = ApplicationManager::new(pending_backend(), 4);
        assert!(!mgr.finish(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_finish_after_natural_completion_reports_no_cancel() {
        let mgr = ApplicationManager::new(Backend::direct(|_scope, _rx, _tx| async {}), 4);
        let conn_id = Uuid::new_v4();

        let _tx = mgr
            .create_instance(conn_id, test_scope(), ReplySlot::new())
            .await
            .expect("create");

        // Give the trivial instance time to run to completion.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(
            !mgr.finish(conn_id).await,
            "completed instance must not report a cancellation"
        );
        assert_eq!(mgr.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_connection_id_is_rejected() {
        let mgr = ApplicationManager::new(pending_backend(), 4);
        let conn_id = Uuid::new_v4();

        let _tx = mgr
            .create_instance(conn_id, test_scope(), ReplySlot::new())
            .await
            .expect("first create");
        let second = mgr
            .create_instance(conn_id, test_scope(), ReplySlot::new())
            .await;

        assert!(matches!(second, Err(CreateError::AlreadyLive(id)) if id == conn_id));
        // The original instance is untouched.
        assert_eq!(mgr.live_count().await, 1);
    }

    #[tokio::test]
    async fn test_creation_failure_spawns_nothing() {
        let mgr = ApplicationManager::new(
            Backend::scoped(|_scope| Err(CreationError("refused".into()))),
            4,
        );

        let result = mgr
            .create_instance(Uuid::new_v4(), test_scope(), ReplySlot::new())
            .await;

        assert!(matches!(result, Err(CreateError::Creation(_))));
        assert_eq!(mgr.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_finish_with_grace_lets_the_instance_drain_its_conduit() {
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<&'static str>(8);
        let mgr = ApplicationManager::new(
            Backend::direct(move |_scope, mut rx: crate::application::AppReceiver, _tx| {
                let seen_tx = seen_tx.clone();
                async move {
                    while let Ok(msg) = rx.recv(None).await {
                        let _ = seen_tx.send(msg.kind()).await;
                    }
                }
            }),
            4,
        );
        let conn_id = Uuid::new_v4();

        let app_tx = mgr
            .create_instance(conn_id, test_scope(), ReplySlot::new())
            .await
            .expect("create");
        app_tx
            .send(BridgeMessage::RequestClosed)
            .expect("push inbound");

        assert!(mgr.finish_with_grace(conn_id, Duration::from_secs(1)).await);
        assert_eq!(mgr.live_count().await, 0, "live set clears immediately");

        // Closing the conduit lets the instance drain and exit on its own.
        drop(app_tx);
        let seen = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("queued message must survive a graceful finish");
        assert_eq!(seen, Some("request_closed"));
    }

    #[tokio::test]
    async fn test_stop_all_clears_every_instance() {
        let mgr = ApplicationManager::new(pending_backend(), 4);
        for _ in 0..3 {
            let _tx = mgr
                .create_instance(Uuid::new_v4(), test_scope(), ReplySlot::new())
                .await
                .expect("create");
        }
        assert_eq!(mgr.live_count().await, 3);

        mgr.stop_all().await;
        assert_eq!(mgr.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_instance_wiring_reaches_the_reply_slot() {
        let mgr = ApplicationManager::new(
            Backend::direct(|_scope, mut rx: crate::application::AppReceiver, tx| async move {
                if let Ok(msg) = rx.recv(None).await {
                    tx.send(msg).await;
                }
            }),
            4,
        );
        let conn_id = Uuid::new_v4();
        let reply = ReplySlot::new();

        let app_tx = mgr
            .create_instance(conn_id, test_scope(), reply.clone())
            .await
            .expect("create");
        app_tx
            .send(BridgeMessage::RequestClosed)
            .expect("push inbound");

        assert_eq!(
            reply.recv(Some(Duration::from_secs(1))).await,
            Ok(BridgeMessage::RequestClosed)
        );
        mgr.finish(conn_id).await;
    }
}
