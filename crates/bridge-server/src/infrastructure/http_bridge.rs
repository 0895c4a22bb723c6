//! HTTP per-request state machine.
//!
//! Each request moves through `created → awaiting-response-header →
//! streaming-response → finished`:
//!
//! 1. The request body is split into bounded chunks and pushed to the
//!    instance's inbound conduit, each send retried when the conduit is
//!    full.  Retry exhaustion fails the request with a 503.
//! 2. The reply loop waits on the connection's reply slot, bounded by
//!    `http_timeout` per wait.  The first `ResponseStart` opens the
//!    response; `ResponseBody` chunks stream until one declares itself
//!    final.
//! 3. A reply that breaks the protocol (a second `ResponseStart`, a body
//!    before the header, any WebSocket variant) is fatal for the request.
//! 4. Every path funnels through one finalize step that cancels the reply
//!    slot and finishes the application instance, exactly once.
//!
//! The state machine is written against the [`ResponseWriter`] seam; hyper
//! provides the production implementation, tests use a recording mock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::{BridgeMessage, RecvError, ReplySlot, Scope, SendError};
use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Version};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::infrastructure::{error_page, sendfile, BoxError, BridgeBody, ServerState};

// ── Response writer seam ──────────────────────────────────────────────────────

/// Why a write did not reach the client.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum WriterError {
    /// The client connection is gone; nothing further can be written.
    #[error("client connection is gone")]
    ClientGone,

    /// The response head was already committed.
    #[error("response already started")]
    AlreadyStarted,
}

/// Where the state machine writes its response.
///
/// One of `start` + `write_body` (streaming) or `send_response` (complete
/// page) is used per request, never both.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Commits status and headers and switches into streaming mode.
    async fn start(
        &mut self,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> Result<(), WriterError>;

    /// Writes one body chunk; `more == false` ends the stream cleanly.
    async fn write_body(&mut self, chunk: Bytes, more: bool) -> Result<(), WriterError>;

    /// Sends a complete prebuilt response (error pages, file responses).
    async fn send_response(&mut self, response: Response<BridgeBody>) -> Result<(), WriterError>;

    /// Ends an open stream abruptly, surfacing an error to the peer.
    async fn abort(&mut self);

    /// Resolves once the client connection is gone; pends forever while the
    /// client is still there.
    async fn client_gone(&mut self);
}

/// Production writer: resolves the pending hyper response with a head and a
/// frame-stream body.
pub struct HyperResponseWriter {
    head: Option<oneshot::Sender<Response<BridgeBody>>>,
    body: Option<mpsc::Sender<Result<Frame<Bytes>, BoxError>>>,
}

impl HyperResponseWriter {
    pub fn new(head: oneshot::Sender<Response<BridgeBody>>) -> Self {
        Self {
            head: Some(head),
            body: None,
        }
    }
}

#[async_trait]
impl ResponseWriter for HyperResponseWriter {
    async fn start(
        &mut self,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> Result<(), WriterError> {
        let head = self.head.take().ok_or(WriterError::AlreadyStarted)?;

        let (body_tx, mut body_rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(16);
        let stream = futures_util::stream::poll_fn(move |cx| body_rx.poll_recv(cx));

        let mut response = Response::new(StreamBody::new(stream).boxed());
        *response.status_mut() =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => warn!(header = %name, "dropping unencodable response header"),
            }
        }

        self.body = Some(body_tx);
        head.send(response).map_err(|_| WriterError::ClientGone)
    }

    async fn write_body(&mut self, chunk: Bytes, more: bool) -> Result<(), WriterError> {
        let Some(tx) = &self.body else {
            return Err(WriterError::ClientGone);
        };
        tx.send(Ok(Frame::data(chunk)))
            .await
            .map_err(|_| WriterError::ClientGone)?;
        if !more {
            // Dropping the sender ends the stream cleanly.
            self.body = None;
        }
        Ok(())
    }

    async fn send_response(&mut self, response: Response<BridgeBody>) -> Result<(), WriterError> {
        let head = self.head.take().ok_or(WriterError::AlreadyStarted)?;
        head.send(response).map_err(|_| WriterError::ClientGone)
    }

    async fn abort(&mut self) {
        if let Some(tx) = self.body.take() {
            let _ = tx.send(Err("response aborted".into())).await;
        }
        self.head = None;
    }

    async fn client_gone(&mut self) {
        // Before the head is committed the oneshot receiver lives in the
        // hyper service future; afterwards the body channel's receiver lives
        // in the streamed response.  Either being dropped means the client
        // side is gone.
        if let Some(head) = self.head.as_mut() {
            head.closed().await;
        } else if let Some(body) = &self.body {
            body.closed().await;
        } else {
            std::future::pending::<()>().await;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Serves one HTTP request.
///
/// The state machine runs on its own task so the hyper service future can
/// resolve as soon as the response head exists; the body keeps streaming
/// behind it.
pub async fn handle(
    state: Arc<ServerState>,
    req: Request<Incoming>,
    mut scope: Scope,
) -> Response<BridgeBody> {
    let (parts, incoming) = req.into_parts();
    scope.method = Some(parts.method.as_str().to_string());
    scope.http_version = Some(version_str(parts.version).to_string());

    let conn_id = Uuid::new_v4();
    debug!(%conn_id, method = %parts.method, path = %scope.path, "http request");

    let (head_tx, head_rx) = oneshot::channel();
    let writer = HyperResponseWriter::new(head_tx);
    tokio::spawn(async move {
        let body = incoming
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|err| Box::new(err) as BoxError);
        run_request(state, conn_id, scope, body, writer).await;
    });

    match head_rx.await {
        Ok(response) => response,
        Err(_) => error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        _ => "1.1",
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

/// Exactly-once teardown for one request.
struct Finalizer {
    state: Arc<ServerState>,
    conn_id: Uuid,
    reply: ReplySlot,
    done: bool,
}

/// How long a finished request's instance may keep running to drain its
/// conduit before it is aborted.
const INSTANCE_GRACE: Duration = Duration::from_secs(1);

impl Finalizer {
    async fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.reply.cancel().await;
        // Grace instead of an immediate abort: teardown paths push final
        // messages (RequestClosed, Disconnect) the instance must still be
        // able to observe.
        self.state
            .manager
            .finish_with_grace(self.conn_id, INSTANCE_GRACE)
            .await;
    }
}

/// Splits a collected body into at-most-`max_chunk_size` chunks, tagging all
/// but the last as non-final.  An empty body still yields one final empty
/// chunk so the consumer always observes a terminated stream.
fn chunk_body(content: Bytes, max_chunk_size: usize) -> Vec<(Bytes, bool)> {
    let max = max_chunk_size.max(1);
    if content.is_empty() {
        return vec![(Bytes::new(), false)];
    }
    let mut rest = content;
    let mut chunks = Vec::with_capacity(rest.len().div_ceil(max));
    while rest.len() > max {
        chunks.push((rest.split_to(max), true));
    }
    chunks.push((rest, false));
    chunks
}

/// Runs the request state machine against an already-collected body.
///
/// `body` is `Err` when the client connection was lost before the body
/// completed; the instance then sees a `RequestClosed` marker and a single
/// `Disconnect` instead of chunks.
pub(crate) async fn run_request<W: ResponseWriter>(
    state: Arc<ServerState>,
    conn_id: Uuid,
    scope: Scope,
    body: Result<Bytes, BoxError>,
    mut writer: W,
) {
    let path = scope.path.clone();
    let if_none_match = scope.header("if-none-match").map(str::to_string);
    let reply = ReplySlot::new();

    let app_tx = match state
        .manager
        .create_instance(conn_id, scope, reply.clone())
        .await
    {
        Ok(tx) => tx,
        Err(err) => {
            warn!(%conn_id, "failed to create application instance: {err}");
            let _ = writer
                .send_response(error_page(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Backend unavailable",
                ))
                .await;
            return;
        }
    };

    let mut finalizer = Finalizer {
        state: Arc::clone(&state),
        conn_id,
        reply: reply.clone(),
        done: false,
    };

    // ── Inbound: deliver the request body ─────────────────────────────────────
    match body {
        Ok(content) => {
            for (chunk, more_content) in chunk_body(content, state.config.max_chunk_size) {
                let msg = BridgeMessage::RequestBody {
                    content: chunk,
                    more_content,
                };
                match app_tx
                    .send_with_retry(
                        msg,
                        state.config.send_retry_count,
                        state.config.send_retry_delay,
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(SendError::Full(_)) => {
                        warn!(%conn_id, path = %path, "inbound conduit saturated, failing request");
                        let _ = writer
                            .send_response(error_page(
                                StatusCode::SERVICE_UNAVAILABLE,
                                "Channel is full",
                            ))
                            .await;
                        finalizer.run().await;
                        return;
                    }
                    Err(SendError::Closed(_)) => {
                        // The instance ended before consuming its body; any
                        // reply it produced is still in the slot.
                        debug!(%conn_id, "instance gone before body delivery completed");
                        break;
                    }
                }
            }
        }
        Err(err) => {
            debug!(%conn_id, "request body ended early: {err}");
            let _ = app_tx.send(BridgeMessage::RequestClosed);
            let _ = app_tx.send(BridgeMessage::Disconnect { path });
            finalizer.run().await;
            return;
        }
    }

    // ── Reply loop ────────────────────────────────────────────────────────────
    let mut started = false;
    loop {
        // The reply wait races the client hanging up, so a disconnect is
        // observed immediately instead of at the reply timeout.
        let wait = tokio::select! {
            result = reply.recv(Some(state.config.http_timeout)) => result,
            () = writer.client_gone() => {
                debug!(%conn_id, "client gone while waiting for application reply");
                let _ = app_tx.send(BridgeMessage::Disconnect { path });
                if started {
                    writer.abort().await;
                }
                finalizer.run().await;
                return;
            }
        };
        match wait {
            Ok(BridgeMessage::ResponseStart { status, headers }) => {
                if started {
                    error!(%conn_id, "second response header, aborting request");
                    writer.abort().await;
                    finalizer.run().await;
                    return;
                }

                if state.config.use_x_sendfile {
                    if let Some(file_path) = take_sendfile_header(&headers) {
                        let response = sendfile::respond(
                            std::path::Path::new(&file_path),
                            if_none_match.as_deref(),
                        )
                        .await;
                        let _ = writer.send_response(response).await;
                        finalizer.run().await;
                        return;
                    }
                }

                match writer.start(status, headers).await {
                    Ok(()) => started = true,
                    Err(_) => {
                        debug!(%conn_id, "client gone before response head");
                        let _ = app_tx.send(BridgeMessage::Disconnect { path });
                        finalizer.run().await;
                        return;
                    }
                }
            }
            Ok(BridgeMessage::ResponseBody {
                content,
                more_content,
            }) => {
                if !started {
                    error!(%conn_id, "response body before response header");
                    let _ = writer
                        .send_response(error_page(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal server error",
                        ))
                        .await;
                    finalizer.run().await;
                    return;
                }
                match writer.write_body(content, more_content).await {
                    Ok(()) => {
                        if !more_content {
                            finalizer.run().await;
                            return;
                        }
                    }
                    Err(_) => {
                        debug!(%conn_id, "client gone mid-response");
                        let _ = app_tx.send(BridgeMessage::Disconnect { path });
                        finalizer.run().await;
                        return;
                    }
                }
            }
            Ok(other) => {
                error!(%conn_id, kind = other.kind(), "protocol violation on http reply channel");
                if started {
                    writer.abort().await;
                } else {
                    let _ = writer
                        .send_response(error_page(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal server error",
                        ))
                        .await;
                }
                finalizer.run().await;
                return;
            }
            Err(RecvError::Timeout) => {
                warn!(%conn_id, path = %path, "timed out waiting for application reply");
                if started {
                    writer.abort().await;
                } else {
                    let _ = writer
                        .send_response(error_page(
                            StatusCode::GATEWAY_TIMEOUT,
                            "Timeout while waiting for upstream",
                        ))
                        .await;
                }
                finalizer.run().await;
                return;
            }
            Err(RecvError::Cancelled) | Err(RecvError::Closed) => {
                if started {
                    writer.abort().await;
                } else {
                    let _ = writer
                        .send_response(error_page(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "Request cancelled",
                        ))
                        .await;
                }
                finalizer.run().await;
                return;
            }
        }
    }
}

/// First `X-Sendfile` header value, matched case-insensitively.  The header
/// itself is never forwarded to the client.
fn take_sendfile_header(headers: &[(String, String)]) -> Option<String> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("x-sendfile"))
        .map(|(_, value)| value.clone())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
