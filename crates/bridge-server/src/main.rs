//! HTTP/WebSocket bridge — entry point.
//!
//! This binary terminates HTTP requests and WebSocket handshakes and turns
//! them into ordered message streams for an in-process application backend.
//! The backend compiled in here is a small echo application; real
//! deployments embed the bridge as a library and supply their own
//! [`Backend`].
//!
//! # Usage
//!
//! ```text
//! bridge-server [OPTIONS]
//!
//! Options:
//!   --bind <ADDR>               Listen address [default: 0.0.0.0:8000]
//!   --root-path <PREFIX>        Mount prefix exposed to applications
//!   --http-timeout <SECS>       Per-reply wait while serving HTTP [default: 120]
//!   --ws-idle-timeout <SECS>    Reply gap before a socket is dropped [default: 86400]
//!   --ping-interval <SECS>      WebSocket ping cadence [default: 20]
//!   --ping-timeout <SECS>       Pong deadline [default: 30]
//!   --ws-protocols <LIST>       Comma-separated negotiable subprotocols
//!   --use-proxy-headers         Trust X-Forwarded-For / X-Forwarded-Port
//!   --use-proxy-proto-header    Trust X-Forwarded-Proto
//!   --use-x-sendfile            Honor the X-Sendfile response header
//!   --start-scheduler           Run the timer-message scheduler
//!   --config <PATH>             TOML config file (flags win over the file)
//! ```
//!
//! # Environment variable overrides
//!
//! Every flag can also come from the environment; CLI args take precedence.
//!
//! | Variable                  | Default        | Description                     |
//! |---------------------------|----------------|---------------------------------|
//! | `BRIDGE_BIND`             | `0.0.0.0:8000` | Listen address                  |
//! | `BRIDGE_ROOT_PATH`        | empty          | Mount prefix                    |
//! | `BRIDGE_HTTP_TIMEOUT`     | `120`          | HTTP reply wait (secs)          |
//! | `BRIDGE_WS_IDLE_TIMEOUT`  | `86400`        | WebSocket idle limit (secs)     |
//! | `BRIDGE_PING_INTERVAL`    | `20`           | Ping cadence (secs)             |
//! | `BRIDGE_PING_TIMEOUT`     | `30`           | Pong deadline (secs)            |
//! | `BRIDGE_WS_PROTOCOLS`     | empty          | Negotiable subprotocols         |
//! | `BRIDGE_CONFIG`           | unset          | TOML config file path           |
//!
//! Precedence: built-in defaults, then the config file, then flags.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bridge_core::{BridgeMessage, ScopeKind};
use bridge_server::application::{AppReceiver, AppSender, Backend};
use bridge_server::domain::{BridgeConfig, ConfigFile};
use bridge_server::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// HTTP/WebSocket to message-channel bridge.
#[derive(Debug, Parser)]
#[command(
    name = "bridge-server",
    about = "Terminates HTTP/WebSocket traffic into ordered application message streams",
    version
)]
struct Cli {
    /// Address and port to listen on.
    #[arg(long, env = "BRIDGE_BIND")]
    bind: Option<std::net::SocketAddr>,

    /// Mount prefix the deployment serves under, exposed to applications.
    #[arg(long, env = "BRIDGE_ROOT_PATH")]
    root_path: Option<String>,

    /// Seconds to wait for each application reply while serving HTTP.
    #[arg(long, env = "BRIDGE_HTTP_TIMEOUT")]
    http_timeout: Option<u64>,

    /// Seconds an open WebSocket may go without an application reply.
    #[arg(long, env = "BRIDGE_WS_IDLE_TIMEOUT")]
    ws_idle_timeout: Option<u64>,

    /// Seconds between WebSocket liveness pings.
    #[arg(long, env = "BRIDGE_PING_INTERVAL")]
    ping_interval: Option<u64>,

    /// Seconds without a pong before a socket is considered dead.
    #[arg(long, env = "BRIDGE_PING_TIMEOUT")]
    ping_timeout: Option<u64>,

    /// Subprotocols the server will negotiate, in preference order.
    #[arg(long, env = "BRIDGE_WS_PROTOCOLS", value_delimiter = ',')]
    ws_protocols: Option<Vec<String>>,

    /// Trust X-Forwarded-For / X-Forwarded-Port for the client address.
    #[arg(long, env = "BRIDGE_USE_PROXY_HEADERS")]
    use_proxy_headers: bool,

    /// Trust X-Forwarded-Proto for the connection scheme.
    #[arg(long, env = "BRIDGE_USE_PROXY_PROTO_HEADER")]
    use_proxy_proto_header: bool,

    /// Honor the X-Sendfile response header.
    #[arg(long, env = "BRIDGE_USE_X_SENDFILE")]
    use_x_sendfile: bool,

    /// Run the timer-message scheduler alongside the listener.
    #[arg(long, env = "BRIDGE_START_SCHEDULER")]
    start_scheduler: bool,

    /// Largest request-body chunk delivered in one message, in bytes.
    #[arg(long, env = "BRIDGE_MAX_CHUNK_SIZE")]
    max_chunk_size: Option<usize>,

    /// Capacity of each per-connection inbound conduit.
    #[arg(long, env = "BRIDGE_CHANNEL_CAPACITY")]
    channel_capacity: Option<usize>,

    /// Attempts per message when a conduit reports it is full.
    #[arg(long, env = "BRIDGE_SEND_RETRY_COUNT")]
    send_retry_count: Option<u32>,

    /// Base backoff between send retries, in milliseconds.
    #[arg(long, env = "BRIDGE_SEND_RETRY_DELAY_MS")]
    send_retry_delay_ms: Option<u64>,

    /// TOML config file; flags override values it sets.
    #[arg(long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Resolves defaults, the config file, and flags into a [`BridgeConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error when the config file cannot be read or parsed.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = BridgeConfig::default();

        if let Some(path) = &self.config {
            ConfigFile::load(path)
                .with_context(|| format!("loading config file {}", path.display()))?
                .overlay(&mut config);
        }

        if let Some(v) = self.bind {
            config.bind_addr = v;
        }
        if let Some(v) = self.root_path {
            config.root_path = v;
        }
        if let Some(v) = self.http_timeout {
            config.http_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.ws_idle_timeout {
            config.ws_idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.ping_interval {
            config.ping_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.ping_timeout {
            config.ping_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.ws_protocols {
            config.ws_protocols = v;
        }
        if self.use_proxy_headers {
            config.use_proxy_headers = true;
        }
        if self.use_proxy_proto_header {
            config.use_proxy_proto_header = true;
        }
        if self.use_x_sendfile {
            config.use_x_sendfile = true;
        }
        if self.start_scheduler {
            config.start_scheduler = true;
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

        Ok(config)
    }
}

// ── Built-in echo backend ─────────────────────────────────────────────────────

/// Pushes one reply, waiting for the bridge to drain the slot first.
async fn push_reply(tx: &AppSender, msg: BridgeMessage) {
    while !tx.send(msg.clone()).await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Echo application: HTTP bodies come back verbatim, WebSocket frames are
/// mirrored.  Exists so the binary is usable out of the box.
fn echo_backend() -> Backend {
    Backend::direct(|scope, mut rx: AppReceiver, tx: AppSender| async move {
        match scope.kind {
            ScopeKind::Http => {
                let mut body = Vec::new();
                loop {
                    match rx.recv(None).await {
                        Ok(BridgeMessage::RequestBody {
                            content,
                            more_content,
                        }) => {
                            body.extend_from_slice(&content);
                            if !more_content {
                                break;
                            }
                        }
                        _ => return,
                    }
                }
                push_reply(
                    &tx,
                    BridgeMessage::ResponseStart {
                        status: 200,
                        headers: vec![("content-type".into(), "text/plain".into())],
                    },
                )
                .await;
                push_reply(
                    &tx,
                    BridgeMessage::ResponseBody {
                        content: Bytes::from(body),
                        more_content: false,
                    },
                )
                .await;
            }
            ScopeKind::WebSocket => loop {
                match rx.recv(None).await {
                    Ok(BridgeMessage::WsConnect { .. }) => {
                        push_reply(&tx, BridgeMessage::WsAccept { subprotocol: None }).await;
                    }
                    Ok(BridgeMessage::WsReceive { frame, .. }) => {
                        push_reply(&tx, BridgeMessage::WsSend { frame }).await;
                    }
                    _ => return,
                }
            },
        }
    })
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `RUST_LOG` controls the log level; absent or invalid falls back to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.into_bridge_config()?;

    info!(
        "bridge starting — bind={}, scheduler={}",
        config.bind_addr, config.start_scheduler
    );

    // Ctrl+C clears the flag; the accept loop checks it every 200 ms and
    // exits cleanly.
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C — initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, echo_backend(), running).await?;

    info!("bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
