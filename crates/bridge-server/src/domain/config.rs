//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! It can be constructed from CLI arguments, from a TOML file, or from
//! defaults; the CLI layer is responsible for precedence (flags win over the
//! file, the file wins over defaults).
//!
//! Keeping configuration as a plain struct (no global state, no environment
//! variable reads inside the domain) makes the bridge easy to embed in tests.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// All runtime configuration for the bridge.
///
/// Build this struct once at startup and wrap it in an `Arc` so it can be
/// shared cheaply across connection tasks.
///
/// | Field                    | Default         |
/// |--------------------------|-----------------|
/// | `bind_addr`              | `0.0.0.0:8000`  |
/// | `root_path`              | `""`            |
/// | `http_timeout`           | 120 s           |
/// | `ws_idle_timeout`        | 86 400 s        |
/// | `ping_interval`          | 20 s            |
/// | `ping_timeout`           | 30 s            |
/// | `ws_protocols`           | empty           |
/// | `use_proxy_headers`      | `false`         |
/// | `use_proxy_proto_header` | `false`         |
/// | `use_x_sendfile`         | `false`         |
/// | `max_chunk_size`         | 950 KiB         |
/// | `channel_capacity`       | 64              |
/// | `send_retry_count`       | 3               |
/// | `send_retry_delay`       | 50 ms           |
/// | `start_scheduler`        | `false`         |
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// The address and port the HTTP/WebSocket listener binds to.
    pub bind_addr: SocketAddr,

    /// Mount prefix the deployment serves under, exposed to applications in
    /// their scope.  Empty for a root-mounted deployment.
    pub root_path: String,

    /// Maximum time to wait for each application reply while serving an HTTP
    /// request.  Expiry produces a 504.
    pub http_timeout: Duration,

    /// Maximum gap between application replies on an open WebSocket before
    /// the socket is dropped.
    pub ws_idle_timeout: Duration,

    /// How often to send a protocol-level ping on open WebSockets.
    pub ping_interval: Duration,

    /// Maximum time without a pong before the socket is considered dead.
    pub ping_timeout: Duration,

    /// Subprotocols the server is willing to negotiate, in preference order.
    pub ws_protocols: Vec<String>,

    /// Trust `X-Forwarded-For` / `X-Forwarded-Port` for the client address.
    /// Only enable behind a proxy that strips inbound copies.
    pub use_proxy_headers: bool,

    /// Trust `X-Forwarded-Proto` for the connection scheme.
    pub use_proxy_proto_header: bool,

    /// Honor the `X-Sendfile` response header by streaming the named file
    /// instead of the application-supplied body.
    pub use_x_sendfile: bool,

    /// Largest request-body chunk delivered to an application in one message.
    pub max_chunk_size: usize,

    /// Capacity of each per-connection inbound conduit.
    pub channel_capacity: usize,

    /// Attempts per message when a conduit reports it is full.
    pub send_retry_count: u32,

    /// Base backoff between retries; attempt *i* waits `i * send_retry_delay`.
    pub send_retry_delay: Duration,

    /// Run the timer-message scheduler alongside the listener.
    pub start_scheduler: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            // Compile-time-known valid socket address string.
            bind_addr: "0.0.0.0:8000".parse().unwrap(),
            root_path: String::new(),
            http_timeout: Duration::from_secs(120),
            ws_idle_timeout: Duration::from_secs(86_400),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(30),
            ws_protocols: Vec::new(),
            use_proxy_headers: false,
            use_proxy_proto_header: false,
            use_x_sendfile: false,
            max_chunk_size: 950 * 1024,
            channel_capacity: 64,
            send_retry_count: 3,
            send_retry_delay: Duration::from_millis(50),
            start_scheduler: false,
        }
    }
}

// ── TOML file schema ──────────────────────────────────────────────────────────

/// On-disk schema.  Every field is optional; absent fields keep whatever the
/// overlay target already holds, so a file only has to name what it changes.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub bind_addr: Option<SocketAddr>,
    pub root_path: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub ws_idle_timeout_secs: Option<u64>,
    pub ping_interval_secs: Option<u64>,
    pub ping_timeout_secs: Option<u64>,
    pub ws_protocols: Option<Vec<String>>,
    pub use_proxy_headers: Option<bool>,
    pub use_proxy_proto_header: Option<bool>,
    pub use_x_sendfile: Option<bool>,
    pub max_chunk_size: Option<usize>,
    pub channel_capacity: Option<usize>,
    pub send_retry_count: Option<u32>,
    pub send_retry_delay_ms: Option<u64>,
    pub start_scheduler: Option<bool>,
}

impl ConfigFile {
    /// Reads and parses a TOML config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read,
    /// [`ConfigError::Parse`] when the TOML is malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Applies every present field onto `config`.
    pub fn overlay(self, config: &mut BridgeConfig) {
        if let Some(v) = self.bind_addr {
            config.bind_addr = v;
        }
        if let Some(v) = self.root_path {
            config.root_path = v;
        }
        if let Some(v) = self.http_timeout_secs {
            config.http_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.ws_idle_timeout_secs {
            config.ws_idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.ping_interval_secs {
            config.ping_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.ping_timeout_secs {
            config.ping_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.ws_protocols {
            config.ws_protocols = v;
        }
        if let Some(v) = self.use_proxy_headers {
            config.use_proxy_headers = v;
        }
        if let Some(v) = self.use_proxy_proto_header {
            config.use_proxy_proto_header = v;
        }
        if let Some(v) = self.use_x_sendfile {
            config.use_x_sendfile = v;
        }
        if let Some(v) = self.max_chunk_size {
            config.max_chunk_size = v;
        }
        if let Some(v) = self.channel_capacity {
            config.channel_capacity = v;
        }
        if let Some(v) = self.send_retry_count {
            config.send_retry_count = v;
        }
        if let Some(v) = self.send_retry_delay_ms {
            config.send_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.start_scheduler {
            config.start_scheduler = v;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
