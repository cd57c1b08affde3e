//! The cross-thread write path.
//!
//! Handler code runs on threads the server does not own, yet all poller
//! state is owned by the server loop. The hand-off works like this:
//!
//! - every connection carries its outbound queue and keep-alive flag
//!   behind a per-connection mutex ([`ConnState`])
//! - any thread may call [`try_write`]: with an empty queue it writes the
//!   buffers straight to the socket in one vectored call; leftovers (or
//!   anything arriving while a queue exists) are appended in order
//! - the caller then pushes the connection's token onto the
//!   [`WakeQueue`] and wakes the poller, and the loop arms write
//!   interest, drains the queue, and decides keep-alive vs close
//!
//! Interest changes and closes never happen here; a foreign thread that
//! hits a write error records it in `pending_close` and lets the loop
//! finish the job. Wire order is guaranteed because appends and drains
//! all happen under the connection mutex, and nobody writes inline while
//! a queue exists.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, Bytes};
use crossbeam_queue::SegQueue;
use mio::net::TcpStream;
use mio::{Token, Waker};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::response::encode_response;
use crate::websocket::{CloseCode, Opcode, encode_frame};
use hearth_core::Response;

/// Connections whose write interest must be (re-)armed by the loop.
///
/// Multi-producer (handler threads, the loop itself), single-consumer
/// (the loop, at the top of each iteration). Duplicate tokens are fine;
/// arming is idempotent and wakeups coalesce.
pub(crate) struct WakeQueue {
    pending: SegQueue<Token>,
    waker: Waker,
}

impl WakeQueue {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            pending: SegQueue::new(),
            waker,
        }
    }

    /// Enqueues a token and unblocks the poller.
    pub(crate) fn enqueue(&self, token: Token) {
        self.pending.push(token);
        self.wake();
    }

    /// Unblocks the poller without enqueueing anything.
    pub(crate) fn wake(&self) {
        // Failure means the poller is gone; the loop is exiting anyway.
        let _ = self.waker.wake();
    }

    pub(crate) fn pop(&self) -> Option<Token> {
        self.pending.pop()
    }
}

/// Mutable per-connection state shared between the loop and handler
/// threads. Always accessed under the connection mutex.
pub(crate) struct ConnState {
    /// Byte buffers awaiting write, in wire order.
    pub(crate) outbound: VecDeque<Bytes>,
    /// Whether the connection survives the current response.
    pub(crate) keep_alive: bool,
    /// Set when a foreign thread hit a write error; the loop closes the
    /// connection with this code at the next queue drain.
    pub(crate) pending_close: Option<CloseCode>,
    /// Guards the one `on_close` notification per connection.
    pub(crate) close_notified: bool,
}

/// A connected socket plus its shared state.
///
/// The loop owns the only strong reference (through its connection
/// table); channels hold weak ones, so writes after close degrade to
/// no-ops instead of touching a dead socket.
pub(crate) struct Conn {
    pub(crate) stream: TcpStream,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) state: Mutex<ConnState>,
}

impl Conn {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            state: Mutex::new(ConnState {
                outbound: VecDeque::new(),
                keep_alive: true,
                pending_close: None,
                close_notified: false,
            }),
        }
    }
}

/// Vectored writes from the queue front until it is empty or the socket
/// is full, popping completed buffers.
///
/// `WouldBlock` is not an error: the queue keeps its remaining buffers
/// for the next readiness event. Writing has to continue until the
/// socket pushes back, because readiness is edge-style and a partial
/// write that never saw `WouldBlock` would get no further event.
pub(crate) fn gather_write(stream: &TcpStream, queue: &mut VecDeque<Bytes>) -> io::Result<()> {
    while !queue.is_empty() {
        let result = {
            let slices: Vec<IoSlice<'_>> = queue.iter().map(|b| IoSlice::new(b)).collect();
            let mut writer = stream;
            writer.write_vectored(&slices)
        };

        match result {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                ));
            }
            Ok(mut written) => {
                while written > 0 {
                    let Some(front) = queue.front_mut() else { break };
                    if front.len() <= written {
                        written -= front.len();
                        queue.pop_front();
                    } else {
                        front.advance(written);
                        written = 0;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Queues (and opportunistically writes) buffers for one connection.
///
/// Callable from any thread. Always enqueues the token afterwards: even
/// a fully inline write must reach the loop, which uses the empty-queue
/// signal to resume reads or close a non-keep-alive connection.
pub(crate) fn try_write(conn: &Conn, token: Token, wake: &WakeQueue, bufs: Vec<Bytes>) {
    {
        let mut state = conn.state.lock();
        if state.pending_close.is_some() {
            return;
        }
        if state.outbound.is_empty() {
            // Empty TCP send buffers are the common case; one syscall
            // from the calling thread usually finishes the response.
            let mut queue: VecDeque<Bytes> =
                bufs.into_iter().filter(|b| !b.is_empty()).collect();
            match gather_write(&conn.stream, &mut queue) {
                Ok(()) => state.outbound = queue,
                Err(e) => {
                    trace!("write to {} failed: {e}", conn.peer_addr);
                    state.pending_close = Some(CloseCode::GoingAway);
                }
            }
        } else {
            // Order must be preserved; the loop owns the drain.
            state
                .outbound
                .extend(bufs.into_iter().filter(|b| !b.is_empty()));
        }
    }
    wake.enqueue(token);
}

/// Opaque handler-facing handle to one connection.
///
/// Cheap to clone (wrap it in an `Arc`, as the server does) and safe to
/// use from any thread at any time; once the connection is closed every
/// send becomes a no-op.
pub struct Channel {
    token: Token,
    conn: Weak<Conn>,
    wake: Arc<WakeQueue>,
    peer_addr: SocketAddr,
    /// True while an HTTP response for the current request cycle is
    /// still owed. Armed by the loop, consumed by `ResponseCallback`.
    response_open: AtomicBool,
}

impl Channel {
    pub(crate) fn new(
        token: Token,
        conn: Weak<Conn>,
        wake: Arc<WakeQueue>,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            token,
            conn,
            wake,
            peer_addr,
            response_open: AtomicBool::new(false),
        }
    }

    /// The peer's socket address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.conn.strong_count() > 0
    }

    /// Writes raw byte buffers to the peer, preserving order across
    /// concurrent callers. A no-op once the connection is closed.
    pub fn send(&self, bufs: Vec<Bytes>) {
        let bufs: Vec<Bytes> = bufs.into_iter().filter(|b| !b.is_empty()).collect();
        if bufs.is_empty() {
            return;
        }
        let Some(conn) = self.conn.upgrade() else {
            trace!("send on closed channel to {}", self.peer_addr);
            return;
        };
        try_write(&conn, self.token, &self.wake, bufs);
    }

    /// Sends a WebSocket text frame.
    pub fn send_text(&self, text: &str) {
        self.send(vec![encode_frame(Opcode::Text, text.as_bytes())]);
    }

    /// Sends a WebSocket binary frame.
    pub fn send_binary(&self, data: &[u8]) {
        self.send(vec![encode_frame(Opcode::Binary, data)]);
    }

    /// Opens a response cycle. Called by the loop before each HTTP
    /// request is handed out.
    pub(crate) fn reset(&self) {
        self.response_open.store(true, Ordering::Release);
    }

    fn take_response_slot(&self) -> bool {
        self.response_open.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("token", &self.token.0)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Delivers the response for one HTTP request.
///
/// Consuming `send` enforces a single response; a duplicate (via a
/// cloned channel) is dropped with a warning rather than corrupting the
/// stream.
pub struct ResponseCallback {
    channel: Arc<Channel>,
}

impl ResponseCallback {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    /// The channel owning this response cycle. Clone it before `send`
    /// to keep pushing data later (e.g. after a WebSocket upgrade).
    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Encodes and writes the response.
    pub fn send(self, response: Response) {
        if !self.channel.take_response_slot() {
            warn!(
                "duplicate response for {} dropped",
                self.channel.peer_addr()
            );
            return;
        }
        let bytes = encode_response(&response);
        self.channel.send(vec![bytes]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    /// A connected (mio, std) TCP pair for exercising real writes.
    fn socket_pair() -> (TcpStream, std::net::TcpStream, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let (server_side, peer_addr) = listener.accept().expect("accept");
        server_side.set_nonblocking(true).expect("nonblocking");
        (TcpStream::from_std(server_side), client, peer_addr)
    }

    fn wake_queue() -> (mio::Poll, Arc<WakeQueue>) {
        let poll = mio::Poll::new().expect("poll");
        let waker = Waker::new(poll.registry(), Token(1)).expect("waker");
        (poll, Arc::new(WakeQueue::new(waker)))
    }

    #[test]
    fn gather_write_preserves_order_and_pops_drained() {
        let (stream, mut client, _) = socket_pair();
        let mut queue: VecDeque<Bytes> = VecDeque::new();
        queue.push_back(Bytes::from_static(b"hello "));
        queue.push_back(Bytes::from_static(b"world"));

        gather_write(&stream, &mut queue).expect("write");
        assert!(queue.is_empty());

        let mut read_back = [0u8; 11];
        client.read_exact(&mut read_back).expect("read");
        assert_eq!(&read_back, b"hello world");
    }

    #[test]
    fn try_write_inline_then_queued_keeps_order() {
        let (stream, mut client, peer_addr) = socket_pair();
        let (_poll, wake) = wake_queue();
        let conn = Arc::new(Conn::new(stream, peer_addr));

        try_write(&conn, Token(2), &wake, vec![Bytes::from_static(b"one ")]);
        // Force the queued path by pre-loading a residual buffer.
        conn.state
            .lock()
            .outbound
            .push_back(Bytes::from_static(b"two "));
        try_write(&conn, Token(2), &wake, vec![Bytes::from_static(b"three")]);

        {
            let mut state = conn.state.lock();
            let queued: Vec<&[u8]> = state.outbound.iter().map(|b| &b[..]).collect();
            assert_eq!(queued, vec![&b"two "[..], &b"three"[..]]);
            gather_write(&conn.stream, &mut state.outbound).expect("drain");
        }

        let mut read_back = [0u8; 13];
        client.read_exact(&mut read_back).expect("read");
        assert_eq!(&read_back, b"one two three");
        assert!(wake.pop().is_some());
    }

    #[test]
    fn try_write_error_records_pending_close() {
        let (stream, client, peer_addr) = socket_pair();
        drop(client);
        let (_poll, wake) = wake_queue();
        let conn = Arc::new(Conn::new(stream, peer_addr));

        // The first write may be absorbed by the kernel; retry the
        // inline path (clearing any residual) until the reset surfaces.
        for _ in 0..50 {
            conn.state.lock().outbound.clear();
            try_write(
                &conn,
                Token(2),
                &wake,
                vec![Bytes::from(vec![0u8; 64 * 1024])],
            );
            let state = conn.state.lock();
            if state.pending_close.is_some() {
                assert_eq!(state.pending_close, Some(CloseCode::GoingAway));
                return;
            }
            drop(state);
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("write error never surfaced");
    }

    #[test]
    fn channel_send_after_close_is_noop() {
        let (stream, _client, peer_addr) = socket_pair();
        let (_poll, wake) = wake_queue();
        let conn = Arc::new(Conn::new(stream, peer_addr));
        let channel = Channel::new(Token(2), Arc::downgrade(&conn), wake.clone(), peer_addr);

        drop(conn);
        assert!(!channel.is_open());
        channel.send(vec![Bytes::from_static(b"late")]);
        assert!(wake.pop().is_none());
    }

    #[test]
    fn response_callback_allows_single_send() {
        let (stream, mut client, peer_addr) = socket_pair();
        let (_poll, wake) = wake_queue();
        let conn = Arc::new(Conn::new(stream, peer_addr));
        let channel = Arc::new(Channel::new(
            Token(2),
            Arc::downgrade(&conn),
            wake,
            peer_addr,
        ));

        channel.reset();
        ResponseCallback::new(channel.clone()).send(Response::ok().body("a"));
        // The cycle is spent: a second callback on the same cycle drops.
        ResponseCallback::new(channel.clone()).send(Response::ok().body("b"));

        let mut read_back = Vec::new();
        client.set_nonblocking(true).expect("nonblocking");
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut tmp = [0u8; 1024];
        while let Ok(n) = client.read(&mut tmp) {
            if n == 0 {
                break;
            }
            read_back.extend_from_slice(&tmp[..n]);
        }
        let text = String::from_utf8(read_back).expect("utf8");
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 1);
        assert!(text.ends_with("\r\na"));
    }
}
