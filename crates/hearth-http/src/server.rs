//! The event-driven server core.
//!
//! One dedicated thread owns the poller, the listener, every connection
//! socket, and a single shared read buffer. Handler callbacks fire on
//! that thread and are expected to dispatch real work elsewhere; replies
//! come back through [`Channel`]/[`ResponseCallback`], which cross the
//! thread boundary via the wake queue (see [`crate::channel`]).
//!
//! Each loop iteration: drain the wake queue and arm write interest for
//! the tokens it names, block in `poll`, then dispatch readiness
//! (accept, read, or write). A connection key is armed for read *or*
//! write, never both; while an HTTP response is outstanding the socket
//! is deregistered entirely, which is what bounds each connection to one
//! in-flight request.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, Conn, ResponseCallback, WakeQueue, gather_write, try_write};
use crate::handler::{CloseStatus, Handler};
use crate::parser::{ParseError, ParseLimits, RequestDecoder};
use crate::response::encode_response;
use crate::websocket::{CloseCode, FrameDecoder, Message, Opcode, encode_close, encode_frame};
use hearth_core::{Response, StatusCode};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
/// Connection tokens start above the two reserved ones.
const TOKEN_BASE: usize = 2;

const EVENTS_CAPACITY: usize = 1024;

/// Default maximum request body size (8 MiB).
pub const DEFAULT_MAX_BODY: usize = 8 * 1024 * 1024;

/// Default maximum request line length (8 KiB).
pub const DEFAULT_MAX_REQUEST_LINE: usize = 8 * 1024;

/// Default shared read buffer size (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to, e.g. `"127.0.0.1:8080"`. Port 0 picks a free
    /// port (see [`Server::local_addr`]).
    pub bind_addr: String,
    /// Maximum request body size in bytes; larger requests get a 413.
    pub max_body: usize,
    /// Maximum request line length in bytes; longer lines get a 414.
    pub max_request_line: usize,
    /// Size of the loop's shared read buffer.
    pub read_buffer_size: usize,
    /// Enable TCP_NODELAY on accepted sockets.
    pub tcp_nodelay: bool,
}

impl ServerConfig {
    /// Creates a configuration with the given bind address.
    #[must_use]
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_body: DEFAULT_MAX_BODY,
            max_request_line: DEFAULT_MAX_REQUEST_LINE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tcp_nodelay: true,
        }
    }

    /// Sets the maximum request body size.
    #[must_use]
    pub fn with_max_body(mut self, bytes: usize) -> Self {
        self.max_body = bytes;
        self
    }

    /// Sets the maximum request line length.
    #[must_use]
    pub fn with_max_request_line(mut self, bytes: usize) -> Self {
        self.max_request_line = bytes;
        self
    }

    /// Sets the shared read buffer size.
    #[must_use]
    pub fn with_read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    /// Enables or disables TCP_NODELAY.
    #[must_use]
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:8080")
    }
}

/// Server error.
#[derive(Debug)]
pub enum ServerError {
    /// The bind address did not parse.
    InvalidAddr(String),
    /// IO error.
    Io(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAddr(addr) => write!(f, "invalid bind address: {addr}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidAddr(_) => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Protocol phase of one connection. The upgrade replaces the variant in
/// place; it never goes back.
enum Phase {
    Http {
        decoder: RequestDecoder,
        /// True from request dispatch until the response has drained;
        /// reads stay suspended meanwhile.
        awaiting_response: bool,
    },
    WebSocket {
        decoder: FrameDecoder,
    },
}

/// What the connection's socket is currently registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Armed {
    Read,
    Write,
    /// Deregistered: an HTTP response is outstanding.
    Paused,
}

/// Per-connection slot in the loop's table.
struct Entry {
    conn: Arc<Conn>,
    channel: Arc<Channel>,
    phase: Phase,
    armed: Armed,
}

/// Moves a connection between read interest, write interest, and
/// deregistered. Idempotent.
fn set_armed(registry: &Registry, entry: &mut Entry, token: Token, target: Armed) {
    if entry.armed == target {
        return;
    }
    let fd = entry.conn.stream.as_raw_fd();
    let mut source = SourceFd(&fd);
    let result = match (entry.armed, target) {
        (_, Armed::Paused) => registry.deregister(&mut source),
        (Armed::Paused, Armed::Read) => registry.register(&mut source, token, Interest::READABLE),
        (Armed::Paused, Armed::Write) => registry.register(&mut source, token, Interest::WRITABLE),
        (_, Armed::Read) => registry.reregister(&mut source, token, Interest::READABLE),
        (_, Armed::Write) => registry.reregister(&mut source, token, Interest::WRITABLE),
    };
    if let Err(e) = result {
        warn!("failed to update interest for {}: {e}", entry.conn.peer_addr);
    }
    entry.armed = target;
}

/// A running (or startable) server.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use hearth_http::{Server, ServerConfig, Handler};
/// # fn demo(handler: Arc<dyn Handler>) -> Result<(), hearth_http::ServerError> {
/// let mut server = Server::bind(ServerConfig::new("127.0.0.1:0"), handler)?;
/// server.start()?;
/// // ...
/// server.stop();
/// # Ok(())
/// # }
/// ```
pub struct Server {
    reactor: Option<Reactor>,
    thread: Option<JoinHandle<()>>,
    wake: Arc<WakeQueue>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the listener and sets up the poller.
    ///
    /// # Errors
    ///
    /// Fails if the address does not parse or the bind/registration
    /// fails.
    pub fn bind(config: ServerConfig, handler: Arc<dyn Handler>) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .bind_addr
            .parse()
            .map_err(|_| ServerError::InvalidAddr(config.bind_addr.clone()))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let wake = Arc::new(WakeQueue::new(waker));
        let running = Arc::new(AtomicBool::new(true));
        let local_addr = listener.local_addr()?;

        let limits = ParseLimits {
            max_request_line: config.max_request_line,
            max_body: config.max_body,
            ..ParseLimits::default()
        };

        let reactor = Reactor {
            poll,
            listener,
            conns: Slab::new(),
            scratch: vec![0u8; config.read_buffer_size].into_boxed_slice(),
            handler,
            limits,
            wake: Arc::clone(&wake),
            running: Arc::clone(&running),
            tcp_nodelay: config.tcp_nodelay,
        };

        info!("listening on {local_addr}");

        Ok(Self {
            reactor: Some(reactor),
            thread: None,
            wake,
            running,
            local_addr,
        })
    }

    /// The bound address (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the server thread.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn start(&mut self) -> Result<(), ServerError> {
        let Some(reactor) = self.reactor.take() else {
            warn!("server already started");
            return Ok(());
        };
        let handle = thread::Builder::new()
            .name("hearth-reactor".into())
            .spawn(move || reactor.run())?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stops the server: closes the listener and every connection,
    /// notifies the handler, and joins the server thread. Idempotent.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.wake.wake();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("server thread panicked");
            }
        } else if let Some(mut reactor) = self.reactor.take() {
            // Bound but never started; tear down on this thread.
            reactor.shutdown();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Reactor {
    poll: Poll,
    listener: TcpListener,
    conns: Slab<Entry>,
    /// Shared read buffer. Loop-owned; decoders copy out of it, nothing
    /// retains a slice past `handle_read`.
    scratch: Box<[u8]>,
    handler: Arc<dyn Handler>,
    limits: ParseLimits,
    wake: Arc<WakeQueue>,
    running: Arc<AtomicBool>,
    tcp_nodelay: bool,
}

impl Reactor {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.drain_pending();

            if !self.running.load(Ordering::Acquire) {
                self.shutdown();
                return;
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if !self.running.load(Ordering::Acquire) {
                    self.shutdown();
                    return;
                }
                // A fault on one iteration must not take the loop down.
                error!("poll failed: {e}");
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => {
                        if event.is_readable() {
                            self.handle_read(token);
                        } else if event.is_writable() {
                            self.handle_write(token);
                        }
                    }
                }
            }
        }
    }

    /// Drains the wake queue: for each still-live token, arm write
    /// interest if bytes are queued, otherwise finish the drained state
    /// (close or resume reading).
    fn drain_pending(&mut self) {
        while let Some(token) = self.wake.pop() {
            let idx = token.0 - TOKEN_BASE;
            let Some(entry) = self.conns.get_mut(idx) else {
                continue;
            };
            let queued = !entry.conn.state.lock().outbound.is_empty();
            if queued {
                set_armed(self.poll.registry(), entry, token, Armed::Write);
            } else {
                self.after_drain(token);
            }
        }
    }

    /// Accepts until the listener would block. Accept failures (e.g.
    /// file-descriptor exhaustion) are logged, never fatal, and never
    /// close the listener.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if self.tcp_nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    let conn = Arc::new(Conn::new(stream, peer_addr));
                    let entry = self.conns.vacant_entry();
                    let token = Token(entry.key() + TOKEN_BASE);
                    let channel = Arc::new(Channel::new(
                        token,
                        Arc::downgrade(&conn),
                        Arc::clone(&self.wake),
                        peer_addr,
                    ));
                    let fd = conn.stream.as_raw_fd();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut SourceFd(&fd), token, Interest::READABLE)
                    {
                        warn!("failed to register socket from {peer_addr}: {e}");
                        continue;
                    }
                    entry.insert(Entry {
                        conn,
                        channel,
                        phase: Phase::Http {
                            decoder: RequestDecoder::new(self.limits.clone()),
                            awaiting_response: false,
                        },
                        armed: Armed::Read,
                    });
                    trace!("accepted connection from {peer_addr}");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Reads into the shared buffer and decodes by phase.
    ///
    /// Readiness is edge-style, so the socket is drained until it would
    /// block. A decoded request that suspends the connection stops
    /// reading immediately; the unread remainder produces a fresh
    /// readiness event once the socket is re-registered.
    fn handle_read(&mut self, token: Token) {
        let idx = token.0 - TOKEN_BASE;
        loop {
            let Some(entry) = self.conns.get(idx) else {
                return;
            };
            if entry.armed != Armed::Read {
                return;
            }

            let read_result = {
                let mut stream = &entry.conn.stream;
                stream.read(&mut self.scratch)
            };

            let n = match read_result {
                // Peer shut the socket down cleanly.
                Ok(0) => {
                    self.close(token, CloseCode::GoingAway);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Peer reset the connection.
                Err(_) => {
                    self.close(token, CloseCode::GoingAway);
                    return;
                }
            };

            let Some(entry) = self.conns.get_mut(idx) else {
                return;
            };
            let is_http = match &mut entry.phase {
                Phase::Http { decoder, .. } => {
                    decoder.push(&self.scratch[..n]);
                    true
                }
                Phase::WebSocket { decoder } => {
                    decoder.push(&self.scratch[..n]);
                    false
                }
            };

            if is_http {
                self.decode_http(token);
            } else {
                self.decode_ws(token);
            }
        }
    }

    /// Decodes at most one HTTP request and hands it to the handler,
    /// suspending reads until its response drains. Surplus bytes stay in
    /// the decoder and are revisited by [`Self::after_drain`].
    fn decode_http(&mut self, token: Token) {
        let idx = token.0 - TOKEN_BASE;
        let failure = {
            let Some(entry) = self.conns.get_mut(idx) else {
                return;
            };
            let Phase::Http {
                decoder,
                awaiting_response,
            } = &mut entry.phase
            else {
                return;
            };
            if *awaiting_response {
                return;
            }

            match decoder.poll() {
                Ok(None) => return,
                Ok(Some(mut request)) => {
                    if request.is_upgrade() {
                        // Carry surplus bytes (frames sent right behind
                        // the handshake) into the frame decoder. The
                        // channel moves across unchanged.
                        let surplus = decoder.take_buffered();
                        let mut ws_decoder = FrameDecoder::new(self.limits.max_body);
                        ws_decoder.push(&surplus);
                        entry.phase = Phase::WebSocket {
                            decoder: ws_decoder,
                        };
                    } else {
                        *awaiting_response = true;
                        entry.conn.state.lock().keep_alive = request.keep_alive();
                    }

                    set_armed(self.poll.registry(), entry, token, Armed::Paused);
                    entry.channel.reset();
                    request.set_remote_addr(entry.conn.peer_addr);
                    let respond = ResponseCallback::new(Arc::clone(&entry.channel));
                    self.handler.on_request(request, respond);
                    return;
                }
                Err(e) => e,
            }
        };

        match failure {
            ParseError::BodyTooLarge => {
                self.reject(token, StatusCode::PAYLOAD_TOO_LARGE, failure);
            }
            ParseError::LineTooLong => {
                self.reject(token, StatusCode::URI_TOO_LONG, failure);
            }
            e => {
                debug!("malformed request: {e}");
                self.close(token, CloseCode::ProtocolError);
            }
        }
    }

    /// Answers an over-limit request with an error response and closes
    /// the connection once it has drained.
    fn reject(&mut self, token: Token, status: StatusCode, reason: ParseError) {
        let idx = token.0 - TOKEN_BASE;
        let Some(entry) = self.conns.get_mut(idx) else {
            return;
        };
        debug!("rejecting request from {}: {reason}", entry.conn.peer_addr);
        entry.conn.state.lock().keep_alive = false;
        if let Phase::Http {
            awaiting_response, ..
        } = &mut entry.phase
        {
            // The decoder is poisoned; no further requests on this
            // connection.
            *awaiting_response = true;
        }
        set_armed(self.poll.registry(), entry, token, Armed::Paused);
        let body = reason.to_string();
        let bytes = encode_response(&Response::new(status).body(body));
        try_write(&entry.conn, token, &self.wake, vec![bytes]);
    }

    /// Decodes and dispatches every complete WebSocket message in the
    /// buffer.
    fn decode_ws(&mut self, token: Token) {
        let idx = token.0 - TOKEN_BASE;
        loop {
            let failure = {
                let Some(entry) = self.conns.get_mut(idx) else {
                    return;
                };
                let Phase::WebSocket { decoder } = &mut entry.phase else {
                    return;
                };
                match decoder.poll() {
                    Ok(None) => return,
                    Ok(Some(message)) => {
                        match message {
                            Message::Text(_) | Message::Binary(_) => {
                                let channel = Arc::clone(&entry.channel);
                                self.handler.on_message(&channel, message);
                            }
                            Message::Ping(payload) => {
                                let pong = encode_frame(Opcode::Pong, &payload);
                                try_write(&entry.conn, token, &self.wake, vec![pong]);
                            }
                            Message::Pong(_) => {}
                            Message::Close(code, reason) => {
                                // The logical connection is over, but the
                                // socket stays open; the peer may close
                                // it or keep it per RFC semantics.
                                let code = code.unwrap_or(CloseCode::Normal);
                                let already_notified = {
                                    let mut state = entry.conn.state.lock();
                                    std::mem::replace(&mut state.close_notified, true)
                                };
                                if !already_notified {
                                    let channel = Arc::clone(&entry.channel);
                                    self.handler.on_close(&channel, CloseStatus::Ws(code));
                                }
                                let echo = encode_close(code, reason.as_deref().unwrap_or(""));
                                try_write(&entry.conn, token, &self.wake, vec![echo]);
                            }
                        }
                        continue;
                    }
                    Err(e) => e,
                }
            };

            warn!("websocket error: {failure}");
            self.close(token, failure.close_code());
            return;
        }
    }

    /// Drains queued bytes on write readiness and settles the
    /// connection's next state.
    fn handle_write(&mut self, token: Token) {
        let idx = token.0 - TOKEN_BASE;
        let Some(entry) = self.conns.get_mut(idx) else {
            return;
        };

        let drained = {
            let mut state = entry.conn.state.lock();
            match gather_write(&entry.conn.stream, &mut state.outbound) {
                Err(e) => {
                    debug!("write to {} failed: {e}", entry.conn.peer_addr);
                    None
                }
                Ok(()) => Some(state.outbound.is_empty()),
            }
        };

        match drained {
            None => self.close(token, CloseCode::GoingAway),
            // Partially written: stay write-armed, the poller will fire
            // again when the socket drains.
            Some(false) => {}
            Some(true) => self.after_drain(token),
        }
    }

    /// The outbound queue is empty: close if the connection is done,
    /// otherwise re-arm reads (and, for HTTP, release the next request).
    fn after_drain(&mut self, token: Token) {
        let idx = token.0 - TOKEN_BASE;
        let Some(entry) = self.conns.get_mut(idx) else {
            return;
        };

        let (pending_close, keep_alive) = {
            let state = entry.conn.state.lock();
            (state.pending_close, state.keep_alive)
        };
        if let Some(code) = pending_close {
            self.close(token, code);
            return;
        }
        if !keep_alive {
            self.close(token, CloseCode::Normal);
            return;
        }

        let is_http = match &mut entry.phase {
            Phase::Http {
                awaiting_response, ..
            } => {
                *awaiting_response = false;
                true
            }
            Phase::WebSocket { .. } => false,
        };
        set_armed(self.poll.registry(), entry, token, Armed::Read);
        // Bytes may already sit in the decoder: a pipelined request, or
        // frames that arrived in the same segment as the upgrade
        // handshake. Revisit them before waiting on the socket.
        if is_http {
            self.decode_http(token);
        } else {
            self.decode_ws(token);
        }
    }

    /// Uniform close path: drop the socket, unregister it, and notify
    /// the handler exactly once. HTTP-phase closes carry no protocol
    /// close code; WebSocket-phase closes report `code`.
    fn close(&mut self, token: Token, code: CloseCode) {
        let idx = token.0 - TOKEN_BASE;
        if !self.conns.contains(idx) {
            return;
        }
        let entry = self.conns.remove(idx);
        if entry.armed != Armed::Paused {
            let fd = entry.conn.stream.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        Self::notify_close(&self.handler, &entry, code);
        trace!("closed connection from {}", entry.conn.peer_addr);
        // Dropping the entry closes the socket and invalidates the
        // channel's weak reference.
    }

    fn notify_close(handler: &Arc<dyn Handler>, entry: &Entry, code: CloseCode) {
        let already_notified = {
            let mut state = entry.conn.state.lock();
            std::mem::replace(&mut state.close_notified, true)
        };
        if already_notified {
            return;
        }
        let status = match entry.phase {
            Phase::Http { .. } => CloseStatus::Http,
            Phase::WebSocket { .. } => CloseStatus::Ws(code),
        };
        handler.on_close(&entry.channel, status);
    }

    /// Final teardown: every live connection gets its close
    /// notification, then the handler learns the server is gone. Sockets,
    /// listener and poller close on drop.
    fn shutdown(&mut self) {
        info!("server stopping, closing {} connection(s)", self.conns.len());
        let entries: Vec<Entry> = self.conns.drain().collect();
        for entry in &entries {
            Self::notify_close(&self.handler, entry, CloseCode::GoingAway);
        }
        drop(entries);
        self.handler.on_shutdown();
    }
}
