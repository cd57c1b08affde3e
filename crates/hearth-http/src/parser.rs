//! Incremental HTTP/1.1 request decoder.
//!
//! [`RequestDecoder`] is a push/poll state machine: the server copies
//! freshly read bytes in with [`push`][RequestDecoder::push] and then
//! calls [`poll`][RequestDecoder::poll], which either yields one complete
//! [`Request`] (resetting itself for the next one, surplus bytes kept
//! buffered) or reports that more input is needed.
//!
//! Limits are enforced while data accumulates, so an oversized request
//! line or body is rejected before it is ever buffered whole.

use crate::connection;
use hearth_core::{HttpVersion, Method, Request};

/// HTTP parsing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid request line.
    InvalidRequestLine,
    /// Invalid HTTP method.
    InvalidMethod,
    /// Invalid header.
    InvalidHeader,
    /// Invalid header name (non-token characters).
    InvalidHeaderName,
    /// A single header line exceeds the limit.
    HeaderLineTooLong,
    /// Too many headers.
    TooManyHeaders,
    /// Header block too large.
    HeadersTooLarge,
    /// Unsupported or invalid Transfer-Encoding.
    InvalidTransferEncoding,
    /// Both Transfer-Encoding and Content-Length present.
    AmbiguousBodyLength,
    /// Malformed chunked encoding.
    InvalidChunk,
    /// Request line exceeds the configured limit.
    LineTooLong,
    /// Body exceeds the configured limit.
    BodyTooLarge,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidMethod => write!(f, "invalid HTTP method"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidHeaderName => write!(f, "invalid header name"),
            Self::HeaderLineTooLong => write!(f, "header line too long"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::HeadersTooLarge => write!(f, "headers too large"),
            Self::InvalidTransferEncoding => write!(f, "invalid transfer-encoding"),
            Self::AmbiguousBodyLength => write!(f, "ambiguous body length"),
            Self::InvalidChunk => write!(f, "malformed chunked encoding"),
            Self::LineTooLong => write!(f, "request line too long"),
            Self::BodyTooLarge => write!(f, "request body too large"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parsing limits.
#[derive(Debug, Clone)]
pub struct ParseLimits {
    /// Maximum request line length in bytes.
    pub max_request_line: usize,
    /// Maximum body size in bytes (Content-Length or decoded chunks).
    pub max_body: usize,
    /// Maximum number of headers.
    pub max_header_count: usize,
    /// Maximum length of a single header line.
    pub max_header_line: usize,
    /// Maximum total header block size (including the CRLF terminator).
    pub max_headers_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_request_line: 8 * 1024,
            max_body: 8 * 1024 * 1024,
            max_header_count: 100,
            max_header_line: 8 * 1024,
            max_headers_size: 64 * 1024,
        }
    }
}

fn is_token_char(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`'
            | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

fn is_valid_header_name(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(|&b| is_token_char(b))
}

fn has_invalid_header_value_bytes(value: &[u8]) -> bool {
    value
        .iter()
        .any(|&b| b == 0 || b == 0x7f || (b < 0x20 && b != b'\t'))
}

fn find_crlf(buffer: &[u8], from: usize) -> Option<usize> {
    buffer[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| from + pos)
}

/// Parsed request line, before headers are known.
#[derive(Debug)]
struct Head {
    method: Method,
    path: String,
    query: Option<String>,
    version: HttpVersion,
}

/// Body framing derived from the header block.
#[derive(Debug, Clone, Copy)]
enum BodyKind {
    Length(usize),
    Chunked,
}

#[derive(Debug)]
enum DecodeState {
    Line,
    Headers {
        head: Head,
        header_start: usize,
    },
    Body {
        request: Box<Request>,
        kind: BodyKind,
        body_start: usize,
    },
}

/// Incremental HTTP/1.1 request decoder.
#[derive(Debug)]
pub struct RequestDecoder {
    limits: ParseLimits,
    buf: Vec<u8>,
    state: DecodeState,
}

impl RequestDecoder {
    /// Creates a decoder with the given limits.
    #[must_use]
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            limits,
            buf: Vec::new(),
            state: DecodeState::Line,
        }
    }

    /// Appends raw bytes to the internal buffer without decoding.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes currently buffered.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Takes all buffered bytes and resets the decoder.
    ///
    /// Used on WebSocket upgrade to hand surplus bytes (early frames
    /// sent in the same segment as the handshake) to the frame decoder.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.state = DecodeState::Line;
        std::mem::take(&mut self.buf)
    }

    /// Attempts to decode one complete request from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. After a request is
    /// returned the decoder is reset; remaining bytes stay buffered, so a
    /// follow-up `poll` (with no intervening `push`) may yield the next
    /// request.
    pub fn poll(&mut self) -> Result<Option<Request>, ParseError> {
        loop {
            let state = std::mem::replace(&mut self.state, DecodeState::Line);
            match state {
                DecodeState::Line => {
                    // Tolerate empty line(s) before the request line (RFC 7230 §3.5).
                    let mut skipped = 0;
                    while self.buf[skipped..].starts_with(b"\r\n") {
                        skipped += 2;
                    }
                    if skipped > 0 {
                        self.buf.drain(..skipped);
                    }

                    let Some(line_end) = find_crlf(&self.buf, 0) else {
                        if self.buf.len() > self.limits.max_request_line {
                            return Err(ParseError::LineTooLong);
                        }
                        return Ok(None);
                    };
                    if line_end > self.limits.max_request_line {
                        return Err(ParseError::LineTooLong);
                    }
                    let head = parse_request_line(&self.buf[..line_end])?;
                    self.state = DecodeState::Headers {
                        head,
                        header_start: line_end + 2,
                    };
                }
                DecodeState::Headers { head, header_start } => {
                    let Some(header_end) = find_crlf_crlf(&self.buf, header_start) else {
                        if self.buf.len().saturating_sub(header_start)
                            > self.limits.max_headers_size
                        {
                            return Err(ParseError::HeadersTooLarge);
                        }
                        self.state = DecodeState::Headers { head, header_start };
                        return Ok(None);
                    };

                    let body_start = header_end + 4;
                    if body_start - header_start > self.limits.max_headers_size {
                        return Err(ParseError::HeadersTooLarge);
                    }

                    let mut request =
                        Request::with_version(head.method, head.path, head.version);
                    request.set_query(head.query);

                    let framing = parse_header_block(
                        &self.buf[header_start..header_end + 2],
                        &self.limits,
                        &mut request,
                    )?;

                    let kind = match framing {
                        Framing::Chunked => Some(BodyKind::Chunked),
                        Framing::Length(len) => {
                            if len > self.limits.max_body {
                                return Err(ParseError::BodyTooLarge);
                            }
                            if len == 0 { None } else { Some(BodyKind::Length(len)) }
                        }
                        Framing::None => None,
                    };

                    match kind {
                        None => {
                            self.finish(&mut request);
                            self.consume(body_start);
                            return Ok(Some(request));
                        }
                        Some(kind) => {
                            self.state = DecodeState::Body {
                                request: Box::new(request),
                                kind,
                                body_start,
                            };
                        }
                    }
                }
                DecodeState::Body {
                    mut request,
                    kind,
                    body_start,
                } => match self.decode_body(kind, body_start)? {
                    Some((body, consumed)) => {
                        request.set_body(body);
                        let mut request = *request;
                        self.finish(&mut request);
                        self.consume(consumed);
                        return Ok(Some(request));
                    }
                    None => {
                        self.state = DecodeState::Body {
                            request,
                            kind,
                            body_start,
                        };
                        return Ok(None);
                    }
                },
            }
        }
    }

    /// Decodes the body, returning `(bytes, total consumed)` when complete.
    fn decode_body(
        &self,
        kind: BodyKind,
        body_start: usize,
    ) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
        match kind {
            BodyKind::Length(len) => {
                if self.buf.len() - body_start < len {
                    return Ok(None);
                }
                let body = self.buf[body_start..body_start + len].to_vec();
                Ok(Some((body, body_start + len)))
            }
            BodyKind::Chunked => self.decode_chunked(body_start),
        }
    }

    fn decode_chunked(&self, body_start: usize) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
        let mut pos = body_start;
        let mut body = Vec::new();

        loop {
            let Some(line_end) = find_crlf(&self.buf, pos) else {
                return self.chunked_incomplete(body_start);
            };
            let size_line = &self.buf[pos..line_end];
            // Chunk extensions after ';' are ignored.
            let size_part = size_line
                .split(|&b| b == b';')
                .next()
                .unwrap_or(size_line);
            let size_str =
                std::str::from_utf8(size_part).map_err(|_| ParseError::InvalidChunk)?;
            let size = usize::from_str_radix(size_str.trim(), 16)
                .map_err(|_| ParseError::InvalidChunk)?;

            pos = line_end + 2;

            if size == 0 {
                // Trailer section: consume header lines until the blank line.
                loop {
                    let Some(trailer_end) = find_crlf(&self.buf, pos) else {
                        return self.chunked_incomplete(body_start);
                    };
                    let empty = trailer_end == pos;
                    pos = trailer_end + 2;
                    if empty {
                        return Ok(Some((body, pos)));
                    }
                }
            }

            if body.len() + size > self.limits.max_body {
                return Err(ParseError::BodyTooLarge);
            }
            if self.buf.len() < pos + size + 2 {
                return self.chunked_incomplete(body_start);
            }
            body.extend_from_slice(&self.buf[pos..pos + size]);
            if &self.buf[pos + size..pos + size + 2] != b"\r\n" {
                return Err(ParseError::InvalidChunk);
            }
            pos += size + 2;
        }
    }

    /// Incomplete chunked body: keep waiting, unless the raw bytes
    /// already exceed what any body within the limit could need.
    fn chunked_incomplete(
        &self,
        body_start: usize,
    ) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
        // Chunk framing overhead is small; 1 KiB of slack is plenty.
        if self.buf.len() - body_start > self.limits.max_body + 1024 {
            return Err(ParseError::BodyTooLarge);
        }
        Ok(None)
    }

    /// Computes the derived per-request bits once decoding completes.
    fn finish(&self, request: &mut Request) {
        request.set_keep_alive(connection::should_keep_alive(request));
        request.set_upgrade(connection::is_websocket_upgrade(request));
    }

    fn consume(&mut self, consumed: usize) {
        if consumed >= self.buf.len() {
            self.buf.clear();
        } else {
            self.buf.drain(..consumed);
        }
        self.state = DecodeState::Line;
    }
}

fn find_crlf_crlf(buffer: &[u8], from: usize) -> Option<usize> {
    if from > buffer.len() {
        return None;
    }
    // The blank line may start at the request line's own terminator.
    let scan_from = from.saturating_sub(2);
    buffer[scan_from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| scan_from + pos)
}

fn parse_request_line(line: &[u8]) -> Result<Head, ParseError> {
    if line.iter().any(|&b| b == 0) {
        return Err(ParseError::InvalidRequestLine);
    }
    let mut parts = line.split(|&b| b == b' ');

    let method_bytes = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let method = Method::from_bytes(method_bytes).ok_or(ParseError::InvalidMethod)?;

    let uri_bytes = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let uri = std::str::from_utf8(uri_bytes).map_err(|_| ParseError::InvalidRequestLine)?;
    if uri.is_empty() {
        return Err(ParseError::InvalidRequestLine);
    }

    let version_bytes = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version_str =
        std::str::from_utf8(version_bytes).map_err(|_| ParseError::InvalidRequestLine)?;
    let version = HttpVersion::parse(version_str).ok_or(ParseError::InvalidRequestLine)?;

    if parts.next().is_some() {
        return Err(ParseError::InvalidRequestLine);
    }

    let (path, query) = match uri.find('?') {
        Some(q_pos) => (uri[..q_pos].to_string(), Some(uri[q_pos + 1..].to_string())),
        None => (uri.to_string(), None),
    };

    Ok(Head {
        method,
        path,
        query,
        version,
    })
}

/// Body framing extracted while parsing headers.
enum Framing {
    None,
    Length(usize),
    Chunked,
}

/// Parses the header block (`block` ends with the final header's CRLF),
/// inserting headers into `request` and returning the body framing.
fn parse_header_block(
    block: &[u8],
    limits: &ParseLimits,
    request: &mut Request,
) -> Result<Framing, ParseError> {
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    let mut header_count = 0usize;

    let mut remaining = block;
    while !remaining.is_empty() {
        let line_end = remaining
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(remaining.len());
        if line_end == 0 {
            break;
        }
        if line_end > limits.max_header_line {
            return Err(ParseError::HeaderLineTooLong);
        }

        let line = &remaining[..line_end];
        // Obsolete line folding is rejected outright (RFC 7230 §3.2.4).
        if matches!(line.first(), Some(b' ' | b'\t')) {
            return Err(ParseError::InvalidHeader);
        }

        header_count += 1;
        if header_count > limits.max_header_count {
            return Err(ParseError::TooManyHeaders);
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::InvalidHeader)?;
        let name_bytes = &line[..colon];
        if !is_valid_header_name(name_bytes) {
            return Err(ParseError::InvalidHeaderName);
        }
        let name = std::str::from_utf8(name_bytes).map_err(|_| ParseError::InvalidHeader)?;

        let raw_value = &line[colon + 1..];
        let start = raw_value
            .iter()
            .position(|&b| b != b' ' && b != b'\t')
            .unwrap_or(raw_value.len());
        let end = raw_value
            .iter()
            .rposition(|&b| b != b' ' && b != b'\t')
            .map_or(start, |p| p + 1);
        let value = &raw_value[start..end];
        if has_invalid_header_value_bytes(value) {
            return Err(ParseError::InvalidHeader);
        }

        if name.eq_ignore_ascii_case("content-length") {
            let len: usize = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or(ParseError::InvalidHeader)?;
            if content_length.is_some_and(|existing| existing != len) {
                return Err(ParseError::InvalidHeader);
            }
            content_length = Some(len);
        }

        if name.eq_ignore_ascii_case("transfer-encoding") {
            let v = std::str::from_utf8(value).map_err(|_| ParseError::InvalidHeader)?;
            if v.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            } else {
                return Err(ParseError::InvalidTransferEncoding);
            }
        }

        request.headers_mut().insert(name.to_string(), value.to_vec());

        remaining = if line_end + 2 <= remaining.len() {
            &remaining[line_end + 2..]
        } else {
            &[]
        };
    }

    // Request smuggling guard: a message with both indicators is rejected.
    if chunked && content_length.is_some() {
        return Err(ParseError::AmbiguousBodyLength);
    }

    if chunked {
        Ok(Framing::Chunked)
    } else if let Some(len) = content_length {
        Ok(Framing::Length(len))
    } else {
        Ok(Framing::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> RequestDecoder {
        RequestDecoder::new(ParseLimits::default())
    }

    fn decode_one(bytes: &[u8]) -> Result<Option<Request>, ParseError> {
        let mut d = decoder();
        d.push(bytes);
        d.poll()
    }

    // ========================================================================
    // Request line
    // ========================================================================

    #[test]
    fn simple_get() {
        let request = decode_one(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap()
            .expect("complete");
        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.path(), "/hello");
        assert_eq!(request.query(), None);
        assert_eq!(request.version(), HttpVersion::Http11);
        assert!(request.keep_alive());
        assert!(!request.is_upgrade());
    }

    #[test]
    fn query_string_split() {
        let request = decode_one(b"GET /items?q=test&page=1 HTTP/1.1\r\n\r\n")
            .unwrap()
            .expect("complete");
        assert_eq!(request.path(), "/items");
        assert_eq!(request.query(), Some("q=test&page=1"));
    }

    #[test]
    fn unknown_method_rejected() {
        assert_eq!(
            decode_one(b"BREW /pot HTTP/1.1\r\n\r\n"),
            Err(ParseError::InvalidMethod)
        );
    }

    #[test]
    fn unknown_version_rejected() {
        assert_eq!(
            decode_one(b"GET / HTTP/2\r\n\r\n"),
            Err(ParseError::InvalidRequestLine)
        );
    }

    #[test]
    fn extra_spaces_rejected() {
        assert_eq!(
            decode_one(b"GET /a b HTTP/1.1\r\n\r\n"),
            Err(ParseError::InvalidRequestLine)
        );
    }

    #[test]
    fn leading_crlf_tolerated() {
        let request = decode_one(b"\r\nGET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(request.path(), "/");
    }

    #[test]
    fn line_too_long_detected_before_crlf_arrives() {
        let limits = ParseLimits {
            max_request_line: 16,
            ..ParseLimits::default()
        };
        let mut d = RequestDecoder::new(limits);
        d.push(b"GET /aaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(d.poll(), Err(ParseError::LineTooLong));
    }

    // ========================================================================
    // Headers
    // ========================================================================

    #[test]
    fn headers_parsed_with_ows_trimmed() {
        let request = decode_one(b"GET / HTTP/1.1\r\nHost:  example.com  \r\nX-N: v\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(request.headers().get("host"), Some(&b"example.com"[..]));
        assert_eq!(request.headers().get("x-n"), Some(&b"v"[..]));
    }

    #[test]
    fn obs_fold_rejected() {
        assert_eq!(
            decode_one(b"GET / HTTP/1.1\r\nHost: a\r\n folded\r\n\r\n"),
            Err(ParseError::InvalidHeader)
        );
    }

    #[test]
    fn invalid_header_name_rejected() {
        assert_eq!(
            decode_one(b"GET / HTTP/1.1\r\nBad Header: v\r\n\r\n"),
            Err(ParseError::InvalidHeaderName)
        );
    }

    #[test]
    fn nul_in_header_value_rejected() {
        assert_eq!(
            decode_one(b"GET / HTTP/1.1\r\nX: a\0b\r\n\r\n"),
            Err(ParseError::InvalidHeader)
        );
    }

    #[test]
    fn too_many_headers_rejected() {
        let mut bytes = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..101 {
            bytes.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
        }
        bytes.extend_from_slice(b"\r\n");
        assert_eq!(decode_one(&bytes), Err(ParseError::TooManyHeaders));
    }

    // ========================================================================
    // Body framing
    // ========================================================================

    #[test]
    fn content_length_body() {
        let request = decode_one(b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap()
            .unwrap();
        assert_eq!(request.body(), b"hello");
    }

    #[test]
    fn body_waits_for_all_bytes() {
        let mut d = decoder();
        d.push(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel");
        assert!(d.poll().unwrap().is_none());
        d.push(b"lo");
        assert_eq!(d.poll().unwrap().unwrap().body(), b"hello");
    }

    #[test]
    fn chunked_body_with_extensions_and_trailers() {
        let request = decode_one(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nTrailer: x\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(request.body(), b"Wikipedia");
    }

    #[test]
    fn chunked_body_incremental() {
        let mut d = decoder();
        d.push(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nab");
        assert!(d.poll().unwrap().is_none());
        d.push(b"c\r\n0\r\n\r\n");
        assert_eq!(d.poll().unwrap().unwrap().body(), b"abc");
    }

    #[test]
    fn invalid_chunk_size_rejected() {
        assert_eq!(
            decode_one(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"),
            Err(ParseError::InvalidChunk)
        );
    }

    #[test]
    fn ambiguous_body_length_rejected() {
        assert_eq!(
            decode_one(
                b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n"
            ),
            Err(ParseError::AmbiguousBodyLength)
        );
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        assert_eq!(
            decode_one(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n"),
            Err(ParseError::InvalidHeader)
        );
    }

    #[test]
    fn oversized_declared_body_rejected() {
        let limits = ParseLimits {
            max_body: 8,
            ..ParseLimits::default()
        };
        let mut d = RequestDecoder::new(limits);
        d.push(b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n");
        assert_eq!(d.poll(), Err(ParseError::BodyTooLarge));
    }

    #[test]
    fn oversized_chunked_body_rejected() {
        let limits = ParseLimits {
            max_body: 4,
            ..ParseLimits::default()
        };
        let mut d = RequestDecoder::new(limits);
        d.push(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n9\r\nwwwwwwwww\r\n");
        assert_eq!(d.poll(), Err(ParseError::BodyTooLarge));
    }

    // ========================================================================
    // Keep-alive / upgrade bits
    // ========================================================================

    #[test]
    fn http10_defaults_to_close() {
        let request = decode_one(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").unwrap().unwrap();
        assert!(!request.keep_alive());
    }

    #[test]
    fn connection_close_detected() {
        let request = decode_one(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!request.keep_alive());
    }

    #[test]
    fn websocket_upgrade_detected() {
        let request = decode_one(
            b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(request.is_upgrade());
    }

    // ========================================================================
    // Buffering across requests
    // ========================================================================

    #[test]
    fn two_requests_in_one_push_poll_in_order() {
        let mut d = decoder();
        d.push(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(d.poll().unwrap().unwrap().path(), "/a");
        assert_eq!(d.poll().unwrap().unwrap().path(), "/b");
        assert!(d.poll().unwrap().is_none());
        assert_eq!(d.buffered_len(), 0);
    }

    #[test]
    fn take_buffered_returns_surplus() {
        let mut d = decoder();
        d.push(b"GET / HTTP/1.1\r\n\r\n\x81\x80\x01\x02\x03\x04");
        assert!(d.poll().unwrap().is_some());
        assert_eq!(d.take_buffered(), b"\x81\x80\x01\x02\x03\x04");
        assert_eq!(d.buffered_len(), 0);
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let bytes = b"POST /x?q=1 HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\nok";
        let mut d = decoder();
        let mut result = None;
        for &b in bytes.iter() {
            d.push(&[b]);
            if let Some(request) = d.poll().expect("no error") {
                result = Some(request);
            }
        }
        let request = result.expect("complete after final byte");
        assert_eq!(request.path(), "/x");
        assert_eq!(request.body(), b"ok");
    }
}
