//! Event-driven HTTP/1.1 and WebSocket server core.
//!
//! A single reactor thread owns a poller, the listening socket, and all
//! connection state; application handlers run wherever the embedder
//! wants and talk back through thread-safe handles. The pieces:
//!
//! - [`parser`]: incremental HTTP request decoding with limits
//! - [`websocket`]: RFC 6455 handshake and frame codec
//! - [`connection`]: Connection-header semantics (keep-alive, upgrade)
//! - [`response`]: response serialization
//! - [`handler`]: the application contract
//! - [`channel`]: the cross-thread write path
//! - [`server`]: the reactor loop and lifecycle
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hearth_core::Response;
//! use hearth_http::{Handler, ResponseCallback, Server, ServerConfig};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_request(&self, request: hearth_core::Request, respond: ResponseCallback) {
//!         respond.send(Response::ok().body(request.path().to_string()));
//!     }
//!     // ...
//! }
//!
//! let mut server = Server::bind(ServerConfig::new("127.0.0.1:8080"), Arc::new(Echo))?;
//! server.start()?;
//! ```

#![deny(unsafe_code)]
// Pedantic clippy lints allowed (style suggestions, not correctness issues)
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::single_match_else)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod connection;
pub mod handler;
mod parser;
mod response;
mod server;
pub mod websocket;

pub use channel::{Channel, ResponseCallback};
pub use connection::{ConnectionInfo, is_websocket_upgrade, should_keep_alive};
pub use handler::{CloseStatus, Handler};
pub use parser::{ParseError, ParseLimits, RequestDecoder};
pub use response::{ResponseWriter, encode_response};
pub use server::{
    DEFAULT_MAX_BODY, DEFAULT_MAX_REQUEST_LINE, DEFAULT_READ_BUFFER_SIZE, Server, ServerConfig,
    ServerError,
};
pub use websocket::{
    CloseCode, FrameDecoder, FrameError, Message, Opcode, accept_key, encode_close, encode_frame,
    upgrade_response, validate_upgrade,
};
