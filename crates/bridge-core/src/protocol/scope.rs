//! Per-connection scope metadata.
//!
//! A [`Scope`] is built once when a connection is dispatched and handed to the
//! application instance at creation.  It is read-only after creation: the
//! dispatch front fills the shared fields, the owning bridge finalizes the
//! protocol-specific ones (method/version for HTTP, subprotocols for
//! WebSocket) before the instance is spawned, and nothing mutates it
//! afterwards.

/// Which protocol a connection was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Http,
    WebSocket,
}

/// Connection metadata handed to an application instance.
///
/// Header names are lower-cased and names containing `_` are dropped before
/// the scope is built (underscore names are a known header-spoofing vector
/// behind CGI-style gateways).  `client` may already reflect proxy-header
/// overrides when the server is configured to trust them.
#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    /// Percent-decoded path segments joined by `/`, always starting with `/`.
    pub path: String,
    /// Raw query string, without the leading `?`.  Empty when absent.
    pub raw_query: String,
    /// Mount prefix the deployment serves under.
    pub root_path: String,
    /// Lower-cased header name/value pairs in arrival order.
    pub headers: Vec<(String, String)>,
    /// Peer address, if known.
    pub client: Option<(String, u16)>,
    /// Local address, if known.
    pub server: Option<(String, u16)>,
    /// `http`/`https` for HTTP scopes, `ws`/`wss` for WebSocket scopes.
    pub scheme: String,
    /// Request method; HTTP scopes only.
    pub method: Option<String>,
    /// `1.0`/`1.1`; HTTP scopes only.
    pub http_version: Option<String>,
    /// Subprotocols offered by the client; WebSocket scopes only.
    pub subprotocols: Vec<String>,
}

impl Scope {
    /// Creates a scope with the shared fields filled and the
    /// protocol-specific ones empty.
    pub fn new(kind: ScopeKind, path: String, raw_query: String, root_path: String) -> Self {
        let scheme = match kind {
            ScopeKind::Http => "http",
            ScopeKind::WebSocket => "ws",
        };
        Self {
            kind,
            path,
            raw_query,
            root_path,
            headers: Vec::new(),
            client: None,
            server: None,
            scheme: scheme.to_string(),
            method: None,
            http_version: None,
            subprotocols: Vec::new(),
        }
    }

    /// Returns the first value of `name`, which must already be lower-case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}
