//! The backend seam.
//!
//! Applications talk to the bridge through two handles: an [`AppReceiver`]
//! that yields inbound [`BridgeMessage`]s and an [`AppSender`] reply slot for
//! outbound ones.  Two calling conventions are supported and normalized once,
//! at instance creation:
//!
//! - **direct**: one call `f(scope, receive, send)` returning the instance
//!   future.
//! - **scoped**: a factory `f(scope)` that may fail, returning a bound
//!   instance which is then called with `(receive, send)`.
//!
//! After [`Backend::bind`] both look identical to the manager, and a factory
//! error is reported before any task is spawned, so a misbehaving factory
//! denies one handshake instead of wedging the bridge.

use std::sync::Arc;

use bridge_core::{BridgeMessage, ConduitReceiver, ReplySlot, Scope};
use futures_util::future::BoxFuture;
use thiserror::Error;

/// Inbound half of an application instance's wiring.
pub type AppReceiver = ConduitReceiver<BridgeMessage>;

/// Outbound half: the connection's reply slot.
pub type AppSender = ReplySlot;

/// A backend bound to one connection's scope, ready to be spawned.
pub type BoundInstance = Box<dyn FnOnce(AppReceiver, AppSender) -> BoxFuture<'static, ()> + Send>;

type DirectFn =
    dyn Fn(Scope, AppReceiver, AppSender) -> BoxFuture<'static, ()> + Send + Sync + 'static;

type ScopedFn = dyn Fn(Scope) -> Result<BoundInstance, CreationError> + Send + Sync + 'static;

/// Error a scoped factory reports when it cannot bind to a scope.
///
/// Creation failures deny the handshake or fail the request; they never
/// crash the bridge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("backend refused to create an instance: {0}")]
pub struct CreationError(pub String);

#[derive(Clone)]
enum Convention {
    Direct(Arc<DirectFn>),
    Scoped(Arc<ScopedFn>),
}

/// A connection-agnostic application backend.
///
/// Cheap to clone; every connection binds its own instance from the shared
/// backend.
#[derive(Clone)]
pub struct Backend {
    convention: Convention,
}

impl Backend {
    /// Wraps a single-call application: `f(scope, receive, send) -> future`.
    pub fn direct<F, Fut>(f: F) -> Self
    where
        F: Fn(Scope, AppReceiver, AppSender) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            convention: Convention::Direct(Arc::new(move |scope, rx, tx| {
                Box::pin(f(scope, rx, tx))
            })),
        }
    }

    /// Wraps a factory application: `f(scope)` yields the bound instance or
    /// a [`CreationError`].
    pub fn scoped<F>(f: F) -> Self
    where
        F: Fn(Scope) -> Result<BoundInstance, CreationError> + Send + Sync + 'static,
    {
        Self {
            convention: Convention::Scoped(Arc::new(f)),
        }
    }

    /// Binds the backend to one connection's scope.
    ///
    /// # Errors
    ///
    /// [`CreationError`] from a scoped factory.  Direct backends cannot fail
    /// to bind.
    pub fn bind(&self, scope: Scope) -> Result<BoundInstance, CreationError> {
        match &self.convention {
            Convention::Direct(f) => {
                let f = Arc::clone(f);
                Ok(Box::new(move |rx, tx| f(scope, rx, tx)))
            }
            Convention::Scoped(factory) => factory(scope),
        }
    }
}
