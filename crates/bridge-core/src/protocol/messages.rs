//! All bridge protocol message types.
//!
//! Every event that crosses the boundary between a socket-facing bridge and
//! an application instance is one [`BridgeMessage`] variant.  Messages flow in
//! both directions over the same enum: the bridge pushes request/frame events
//! inbound, the application pushes response/frame events back through its
//! reply slot.  Which variants are legal in which direction is enforced by the
//! bridges, not by the type.

use bytes::Bytes;

// ── WebSocket frame payloads ──────────────────────────────────────────────────

/// Payload of a single WebSocket data frame.
///
/// Text frames carry valid UTF-8; binary frames carry raw bytes.  Control
/// frames (ping/pong/close) never appear here, the bridges handle those at
/// the socket layer.
#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame {
    Text(String),
    Binary(Bytes),
}

impl WsFrame {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            WsFrame::Text(s) => s.len(),
            WsFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Bridge messages ───────────────────────────────────────────────────────────

/// One protocol event, tagged by variant.
///
/// HTTP variants:
///
/// | Variant         | Direction      | Meaning                                  |
/// |-----------------|----------------|------------------------------------------|
/// | `RequestBody`   | bridge → app   | one request-body chunk                   |
/// | `RequestClosed` | bridge → app   | body stream ended early (client lost)    |
/// | `ResponseStart` | app → bridge   | status + headers, exactly once           |
/// | `ResponseBody`  | app → bridge   | one response-body chunk                  |
/// | `Disconnect`    | bridge → app   | client went away, pushed exactly once    |
///
/// WebSocket variants:
///
/// | Variant        | Direction      | Meaning                                   |
/// |----------------|----------------|-------------------------------------------|
/// | `WsConnect`    | bridge → app   | handshake attempt (order always 0)        |
/// | `WsAccept`     | app → bridge   | accept the handshake                      |
/// | `WsReceive`    | bridge → app   | inbound data frame                        |
/// | `WsSend`       | app → bridge   | outbound data frame                       |
/// | `WsClose`      | app → bridge   | close (deny if still unaccepted)          |
/// | `WsDisconnect` | bridge → app   | socket closed, pushed exactly once        |
///
/// `order` tags are produced by a per-connection
/// [`SequenceCounter`](crate::protocol::SequenceCounter) so the application
/// can reconstruct event ordering even when it consumes lazily.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    RequestBody {
        content: Bytes,
        /// `false` marks the final chunk.
        more_content: bool,
    },
    RequestClosed,
    ResponseStart {
        status: u16,
        headers: Vec<(String, String)>,
    },
    ResponseBody {
        content: Bytes,
        more_content: bool,
    },
    Disconnect {
        path: String,
    },
    WsConnect {
        order: u64,
    },
    WsAccept {
        /// Subprotocol the application selected, if any.
        subprotocol: Option<String>,
    },
    WsReceive {
        order: u64,
        frame: WsFrame,
    },
    WsSend {
        frame: WsFrame,
    },
    WsClose {
        /// Close code; `None` means the default 1000 (normal closure).
        code: Option<u16>,
    },
    WsDisconnect {
        order: u64,
        code: u16,
    },
}

impl BridgeMessage {
    /// Static tag name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::RequestBody { .. } => "request_body",
            BridgeMessage::RequestClosed => "request_closed",
            BridgeMessage::ResponseStart { .. } => "response_start",
            BridgeMessage::ResponseBody { .. } => "response_body",
            BridgeMessage::Disconnect { .. } => "disconnect",
            BridgeMessage::WsConnect { .. } => "ws_connect",
            BridgeMessage::WsAccept { .. } => "ws_accept",
            BridgeMessage::WsReceive { .. } => "ws_receive",
            BridgeMessage::WsSend { .. } => "ws_send",
            BridgeMessage::WsClose { .. } => "ws_close",
            BridgeMessage::WsDisconnect { .. } => "ws_disconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_every_variant() {
        let cases: Vec<(BridgeMessage, &str)> = vec![
            (
                BridgeMessage::RequestBody {
                    content: Bytes::from_static(b"x"),
                    more_content: true,
                },
                "request_body",
            ),
            (BridgeMessage::RequestClosed, "request_closed"),
            (
                BridgeMessage::ResponseStart {
                    status: 200,
                    headers: vec![],
                },
                "response_start",
            ),
            (
                BridgeMessage::Disconnect {
                    path: "/".to_string(),
                },
                "disconnect",
            ),
            (BridgeMessage::WsConnect { order: 0 }, "ws_connect"),
            (BridgeMessage::WsClose { code: None }, "ws_close"),
        ];

        for (msg, expected) in cases {
            assert_eq!(msg.kind(), expected);
        }
    }

    #[test]
    fn test_ws_frame_len_counts_bytes_not_chars() {
        // "é" is one char but two UTF-8 bytes.
        let frame = WsFrame::Text("é".to_string());
        assert_eq!(frame.len(), 2);
        assert!(!frame.is_empty());

        let empty = WsFrame::Binary(Bytes::new());
        assert!(empty.is_empty());
    }
}
