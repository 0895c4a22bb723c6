//! Infrastructure layer for the bridge server.
//!
//! Everything socket-facing lives here: the accept loop, the dispatch front
//! that classifies connections and builds scopes, the HTTP and WebSocket
//! per-connection state machines, and the conditional static-file responder.
//!
//! # What does NOT belong here?
//!
//! - Application instance lifecycle (that is the application layer)
//! - Message type definitions (those live in `bridge-core`)
//! - Configuration parsing (that is done in `main.rs`)

pub mod dispatch;
pub mod http_bridge;
pub mod sendfile;
pub mod server;
pub mod ws_bridge;

pub use server::{run_server, run_with_listener, ServerState};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};

/// Boxed error used by streamed response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type every handler produces.
pub type BridgeBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// An empty response body.
pub fn empty_body() -> BridgeBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// A complete in-memory response body.
pub fn full_body(content: impl Into<Bytes>) -> BridgeBody {
    Full::new(content.into()).map_err(|never| match never {}).boxed()
}

/// Builds a plain-text error page.
pub fn error_page(status: StatusCode, text: &str) -> Response<BridgeBody> {
    let mut response = Response::new(full_body(text.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
