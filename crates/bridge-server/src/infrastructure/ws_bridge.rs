//! WebSocket per-connection state machine.
//!
//! A handshake is not accepted until the application says so: the `101` is
//! withheld while the instance decides, and a pre-accept `WsClose` (or a
//! creation failure) turns the handshake into a plain HTTP denial.  Once
//! upgraded, the session runs three tasks:
//!
//! - **reader**: client frames in, ordered `WsReceive` events out
//! - **replier**: application replies out of the slot, frames to the client
//! - **pinger**: liveness probes, closing sessions whose pongs stop
//!
//! The first task to finish decides the close code; the others are aborted
//! outright.  Teardown always emits exactly one ordered `WsDisconnect` and
//! finishes the instance.

use std::sync::Arc;

use bridge_core::{BridgeMessage, RecvError, SequenceCounter, WsFrame};
use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bridge_core::{ConduitSender, ReplySlot, Scope};

use crate::infrastructure::{empty_body, error_page, BridgeBody, ServerState};

const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_ABNORMAL: u16 = 1006;

/// Serves one WebSocket handshake, deferring acceptance to the application.
pub async fn handle(
    state: Arc<ServerState>,
    mut req: Request<Incoming>,
    mut scope: Scope,
) -> Response<BridgeBody> {
    let Some(key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return error_page(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
    };

    scope.subprotocols = req
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default();
    let offers = scope.subprotocols.clone();
    let path = scope.path.clone();

    let conn_id = Uuid::new_v4();
    debug!(%conn_id, path = %path, "websocket handshake");

    let reply = ReplySlot::new();
    let app_tx = match state
        .manager
        .create_instance(conn_id, scope, reply.clone())
        .await
    {
        Ok(tx) => tx,
        Err(err) => {
            warn!(%conn_id, "failed to create application instance: {err}");
            return error_page(StatusCode::FORBIDDEN, "Connection refused");
        }
    };

    let order = Arc::new(SequenceCounter::new());
    if let Err(err) = app_tx
        .send_with_retry(
            BridgeMessage::WsConnect {
                order: order.next(),
            },
            state.config.send_retry_count,
            state.config.send_retry_delay,
        )
        .await
    {
        warn!(%conn_id, "could not deliver connect event: {err}");
        state.manager.finish(conn_id).await;
        return error_page(StatusCode::SERVICE_UNAVAILABLE, "Channel is full");
    }

    // Withhold the 101 until the application accepts.  Sessions live on the
    // idle timeout, and so does the wait for this first reply.
    let subprotocol = match reply.recv(Some(state.config.ws_idle_timeout)).await {
        Ok(BridgeMessage::WsAccept { subprotocol }) => {
            negotiate_subprotocol(subprotocol, &offers, &state.config.ws_protocols)
        }
        Ok(BridgeMessage::WsClose { .. }) => {
            debug!(%conn_id, "application denied the handshake");
            state.manager.finish(conn_id).await;
            return error_page(StatusCode::FORBIDDEN, "Connection denied");
        }
        Ok(other) => {
            error!(%conn_id, kind = other.kind(), "protocol violation during handshake");
            state.manager.finish(conn_id).await;
            return error_page(StatusCode::FORBIDDEN, "Connection denied");
        }
        Err(RecvError::Timeout) => {
            warn!(%conn_id, "application never answered the handshake");
            state.manager.finish(conn_id).await;
            return error_page(StatusCode::GATEWAY_TIMEOUT, "Timeout while waiting for upstream");
        }
        Err(_) => {
            state.manager.finish(conn_id).await;
            return error_page(StatusCode::SERVICE_UNAVAILABLE, "Request cancelled");
        }
    };

    let upgrade = hyper::upgrade::on(&mut req);
    {
        let state = Arc::clone(&state);
        let reply = reply.clone();
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    let ws = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    run_session(state, conn_id, path, ws, app_tx, reply, order).await;
                }
                Err(err) => {
                    debug!(%conn_id, "upgrade failed: {err}");
                    reply.cancel().await;
                    state.manager.finish(conn_id).await;
                }
            }
        });
    }

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    }
    if let Some(proto) = subprotocol {
        if let Ok(value) = HeaderValue::from_str(&proto) {
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    response
}

/// The application's explicit choice wins; otherwise the first client offer
/// the server-side whitelist contains.
fn negotiate_subprotocol(
    app_choice: Option<String>,
    offers: &[String],
    supported: &[String],
) -> Option<String> {
    app_choice.or_else(|| {
        offers
            .iter()
            .find(|offer| supported.contains(offer))
            .cloned()
    })
}

/// Runs an accepted session until one of the three tasks ends it.
async fn run_session<S>(
    state: Arc<ServerState>,
    conn_id: Uuid,
    path: String,
    ws: WebSocketStream<S>,
    app_tx: ConduitSender<BridgeMessage>,
    reply: ReplySlot,
    order: Arc<SequenceCounter>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let sink = Arc::new(Mutex::new(sink));
    let last_pong = Arc::new(Mutex::new(Instant::now()));
    // Refreshed by traffic in either direction; the idle check reads it.
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let reply_teardown = reply.clone();

    // ── Reader: client frames in ──────────────────────────────────────────────
    let mut reader = {
        let app_tx = app_tx.clone();
        let order = Arc::clone(&order);
        let sink = Arc::clone(&sink);
        let last_pong = Arc::clone(&last_pong);
        let last_activity = Arc::clone(&last_activity);
        let retry_count = state.config.send_retry_count;
        let retry_delay = state.config.send_retry_delay;
        tokio::spawn(async move {
            loop {
                let frame = match stream.next().await {
                    Some(Ok(Message::Text(text))) => WsFrame::Text(text),
                    Some(Ok(Message::Binary(data))) => WsFrame::Binary(data.into()),
                    Some(Ok(Message::Pong(_))) => {
                        *last_pong.lock().await = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        return frame
                            .map(|f| u16::from(f.code))
                            .unwrap_or(CLOSE_NO_STATUS);
                    }
                    Some(Err(_)) | None => return CLOSE_ABNORMAL,
                };

                *last_activity.lock().await = Instant::now();
                let msg = BridgeMessage::WsReceive {
                    order: order.next(),
                    frame,
                };
                if let Err(err) = app_tx.send_with_retry(msg, retry_count, retry_delay).await {
                    // Backpressure the client cannot see otherwise: ask it to
                    // try again later.
                    warn!("inbound conduit saturated, closing session: {err}");
                    let _ = sink
                        .lock()
                        .await
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Again,
                            reason: "".into(),
                        })))
                        .await;
                    return u16::from(CloseCode::Again);
                }
            }
        })
    };

    // ── Replier: application frames out ───────────────────────────────────────
    let mut replier = {
        let reply = reply.clone();
        let sink = Arc::clone(&sink);
        let last_activity = Arc::clone(&last_activity);
        let idle_timeout = state.config.ws_idle_timeout;
        tokio::spawn(async move {
            loop {
                match reply.recv(Some(idle_timeout)).await {
                    Ok(BridgeMessage::WsSend { frame }) => {
                        let message = match frame {
                            WsFrame::Text(text) => Message::Text(text),
                            WsFrame::Binary(data) => Message::Binary(data.to_vec()),
                        };
                        if sink.lock().await.send(message).await.is_err() {
                            return None;
                        }
                        *last_activity.lock().await = Instant::now();
                    }
                    Ok(BridgeMessage::WsClose { code }) => {
                        let code = code.unwrap_or(1000);
                        let _ = sink
                            .lock()
                            .await
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            })))
                            .await;
                        return Some(code);
                    }
                    Ok(other) => {
                        error!(kind = other.kind(), "protocol violation on ws reply channel");
                        return None;
                    }
                    Err(RecvError::Timeout) => {
                        // The slot being quiet is not enough: inbound frames
                        // keep a session alive too.
                        if last_activity.lock().await.elapsed() < idle_timeout {
                            continue;
                        }
                        warn!("session idle past the limit, dropping");
                        return None;
                    }
                    Err(_) => return None,
                }
            }
        })
    };

    // ── Pinger: liveness probes ───────────────────────────────────────────────
    let mut pinger = {
        let sink = Arc::clone(&sink);
        let last_pong = Arc::clone(&last_pong);
        let ping_interval = state.config.ping_interval;
        let ping_timeout = state.config.ping_timeout;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if last_pong.lock().await.elapsed() > ping_timeout {
                    warn!("no pong within the timeout, dropping session");
                    return;
                }
                if sink.lock().await.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        })
    };

    // First finisher decides the close code; the rest are dropped hard.
    let close_code = tokio::select! {
        res = &mut reader => res.unwrap_or(CLOSE_ABNORMAL),
        res = &mut replier => res.map(|c| c.unwrap_or(CLOSE_ABNORMAL)).unwrap_or(CLOSE_ABNORMAL),
        _ = &mut pinger => CLOSE_ABNORMAL,
    };
    reader.abort();
    replier.abort();
    pinger.abort();

    let disconnect = BridgeMessage::WsDisconnect {
        order: order.next(),
        code: close_code,
    };
    if let Err(err) = app_tx
        .send_with_retry(
            disconnect,
            state.config.send_retry_count,
            state.config.send_retry_delay,
        )
        .await
    {
        debug!(%conn_id, "disconnect event not delivered: {err}");
    }

    reply_teardown.cancel().await;
    state.manager.finish(conn_id).await;
    info!(%conn_id, path = %path, code = close_code, "websocket session closed");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
