//! Dispatch front: classify connections and build scopes.
//!
//! Every inbound request passes through [`handle`]: it is classified as a
//! WebSocket handshake or a plain HTTP request, a [`Scope`] is built from the
//! request line and headers, and the connection is routed to the matching
//! state machine.
//!
//! Scope construction applies the trust rules in one place:
//!
//! - header names are lower-cased, and names containing `_` are dropped
//!   before anything downstream can read them
//! - `X-Forwarded-For` / `X-Forwarded-Port` override the client address only
//!   when `use_proxy_headers` is set; the first comma-separated element wins
//!   and an unparseable port degrades to 0
//! - when `use_proxy_proto_header` is set, an `x-forwarded-proto` header
//!   reflecting this hop's transport is appended to the forwarded headers
//!   (the bridge terminates plaintext only, so the value is always `http`)

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bridge_core::{Scope, ScopeKind};
use hyper::body::Incoming;
use hyper::{header, Request, Response};
use percent_encoding::percent_decode_str;

use crate::domain::BridgeConfig;
use crate::infrastructure::{http_bridge, ws_bridge, BridgeBody, ServerState};

/// Entry point for every request on every connection.
pub async fn handle(
    state: Arc<ServerState>,
    peer: SocketAddr,
    local: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BridgeBody>, Infallible> {
    let response = if is_websocket_upgrade(&req) {
        let scope = build_scope(&req, &state.config, ScopeKind::WebSocket, peer, local);
        ws_bridge::handle(state, req, scope).await
    } else {
        let scope = build_scope(&req, &state.config, ScopeKind::Http, peer, local);
        http_bridge::handle(state, req, scope).await
    };
    Ok(response)
}

/// A connection is a WebSocket handshake iff its `Upgrade` header
/// case-insensitively equals `websocket`.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"websocket"))
        .unwrap_or(false)
}

/// Builds the shared scope fields; the owning bridge finalizes the
/// protocol-specific ones.
pub fn build_scope<B>(
    req: &Request<B>,
    config: &BridgeConfig,
    kind: ScopeKind,
    peer: SocketAddr,
    local: SocketAddr,
) -> Scope {
    let path = decode_path(req.uri().path());
    let raw_query = req.uri().query().unwrap_or("").to_string();
    let mut scope = Scope::new(kind, path, raw_query, config.root_path.clone());

    for (name, value) in req.headers() {
        let name = name.as_str().to_ascii_lowercase();
        // Underscore names are dropped outright: CGI-style gateways collapse
        // `-` and `_` to the same variable, which makes them spoofable.
        if name.contains('_') {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        scope.headers.push((name, value));
    }

    scope.client = Some((peer.ip().to_string(), peer.port()));
    scope.server = Some((local.ip().to_string(), local.port()));

    if config.use_proxy_headers {
        apply_forwarded_client(&mut scope);
    }
    if config.use_proxy_proto_header {
        inject_forwarded_proto(&mut scope);
    }
    scope
}

/// Percent-decodes each path segment, preserving the `/` separators.
fn decode_path(raw: &str) -> String {
    raw.split('/')
        .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn apply_forwarded_client(scope: &mut Scope) {
    let host = scope
        .header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    let Some(host) = host.filter(|h| !h.is_empty()) else {
        return;
    };
    let port = scope
        .header("x-forwarded-port")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().parse().unwrap_or(0))
        .unwrap_or(0);
    scope.client = Some((host, port));
}

/// Appends an `x-forwarded-proto` header describing this hop's transport so
/// the application can reconstruct the full chain.  The bridge terminates
/// plaintext only.
fn inject_forwarded_proto(scope: &mut Scope) {
    scope
        .headers
        .push(("x-forwarded-proto".to_string(), "http".to_string()));
}

// ── Tests ─────────────────────────────────────────────────────────────────────
