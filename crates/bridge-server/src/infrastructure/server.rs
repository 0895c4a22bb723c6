//! TCP accept loop and connection serving.
//!
//! One listener, one hyper HTTP/1 connection task per accepted socket, a
//! shutdown flag polled between accepts.  When the scheduler is enabled its
//! control conduit is registered before the first accept so producers never
//! race the listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bridge_core::ChannelRegistry;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::application::{scheduler, ApplicationManager, Backend, Scheduler};
use crate::domain::BridgeConfig;
use crate::infrastructure::dispatch;

/// Shared state every connection handler sees.
pub struct ServerState {
    pub config: Arc<BridgeConfig>,
    pub manager: Arc<ApplicationManager>,
}

/// Binds the configured address and serves until `running` clears.
pub async fn run_server(
    config: BridgeConfig,
    backend: Backend,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    run_with_listener(listener, config, backend, running).await
}

/// Serves on an already-bound listener until `running` clears.
pub async fn run_with_listener(
    listener: TcpListener,
    config: BridgeConfig,
    backend: Backend,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let local_addr = listener
        .local_addr()
        .context("listener has no local address")?;
    info!("bridge listening on {local_addr}");

    let config = Arc::new(config);
    let manager = Arc::new(ApplicationManager::new(backend, config.channel_capacity));
    let state = Arc::new(ServerState {
        config: Arc::clone(&config),
        manager: Arc::clone(&manager),
    });

    let scheduler_task = if config.start_scheduler {
        let registry = Arc::new(ChannelRegistry::<serde_json::Value>::new());
        let control_rx = registry.register(scheduler::CONTROL_CHANNEL, config.channel_capacity);
        let scheduler = Arc::new(Scheduler::new(registry));
        let handle = tokio::spawn(Arc::clone(&scheduler).run(control_rx));
        Some((scheduler, handle))
    } else {
        None
    };

    while running.load(Ordering::SeqCst) {
        // Bounded accept wait so the shutdown flag is observed promptly.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let state = Arc::clone(&state);
                tokio::spawn(serve_connection(stream, peer, local_addr, state));
            }
            Ok(Err(err)) => {
                error!("failed to accept connection: {err}");
            }
            Err(_) => continue,
        }
    }

    info!("shutdown requested, stopping");
    if let Some((scheduler, handle)) = scheduler_task {
        scheduler.shutdown().await;
        handle.abort();
    }
    manager.stop_all().await;
    info!("all application instances stopped");
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    state: Arc<ServerState>,
) {
    debug!("connection from {peer}");
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { dispatch::handle(state, peer, local, req).await }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        debug!("connection from {peer} ended: {err}");
    }
}
