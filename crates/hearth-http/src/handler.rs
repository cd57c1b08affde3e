//! The application handler contract.

use std::sync::Arc;

use crate::channel::{Channel, ResponseCallback};
use crate::websocket::{CloseCode, Message};
use hearth_core::Request;

/// Terminal status of a connection, as reported to [`Handler::on_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// The connection closed while still in HTTP phase; HTTP has no
    /// protocol-level close code.
    Http,
    /// The connection closed in WebSocket phase with this close code
    /// (locally chosen or peer-supplied).
    Ws(CloseCode),
}

impl std::fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Ws(code) => write!(f, "ws({code})"),
        }
    }
}

/// Application callbacks invoked by the server.
///
/// All methods run on the reactor thread and must return promptly;
/// implementations that do real work hand it to their own worker threads
/// and reply later through the [`Channel`] or [`ResponseCallback`], both
/// of which are safe to use from any thread.
pub trait Handler: Send + Sync {
    /// Called once per complete HTTP request.
    ///
    /// Reads on this connection are suspended until `respond` delivers
    /// the response, so at most one request per connection is in flight.
    fn on_request(&self, request: Request, respond: ResponseCallback);

    /// Called once per complete WebSocket text or binary message.
    ///
    /// Ping and Close frames never reach this method; the server answers
    /// them itself.
    fn on_message(&self, channel: &Arc<Channel>, message: Message);

    /// Called exactly once per accepted connection when it reaches a
    /// terminal state: peer EOF or reset, protocol error, keep-alive
    /// expiry, a WebSocket Close frame, or server shutdown.
    fn on_close(&self, channel: &Arc<Channel>, status: CloseStatus);

    /// Called once when the server stops.
    fn on_shutdown(&self) {}
}
