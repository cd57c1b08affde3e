//! WebSocket protocol support (RFC 6455).
//!
//! Layered like the HTTP side of the crate:
//!
//! 1. **Handshake** — upgrade validation and the 101 Switching Protocols
//!    response, with dependency-free SHA-1 and base64
//! 2. **Frame codec** — an incremental push/poll decoder producing
//!    [`Message`] values, and encoders for server-to-client frames
//!
//! Client-to-server frames must be masked; server frames are never
//! masked (RFC 6455 §5.1). Fragmented data messages are reassembled
//! before delivery; control frames are surfaced individually.

use bytes::Bytes;
use hearth_core::{Method, Request, Response, StatusCode};

// ============================================================================
// SHA-1 (RFC 3174) — used only for the handshake accept key
// ============================================================================

/// SHA-1 digest (20 bytes / 160 bits).
///
/// Standard SHA-1 variable names (a-e, h0-h4, w[]) follow RFC 3174.
#[allow(clippy::many_single_char_names)]
fn sha1(data: &[u8]) -> [u8; 20] {
    let mut h0: u32 = 0x6745_2301;
    let mut h1: u32 = 0xEFCD_AB89;
    let mut h2: u32 = 0x98BA_DCFE;
    let mut h3: u32 = 0x1032_5476;
    let mut h4: u32 = 0xC3D2_E1F0;

    let bit_len = (data.len() as u64) * 8;
    let mut msg = data.to_vec();
    msg.push(0x80);
    while (msg.len() % 64) != 56 {
        msg.push(0);
    }
    msg.extend_from_slice(&bit_len.to_be_bytes());

    for block in msg.chunks_exact(64) {
        let mut w = [0u32; 80];
        for (idx, word) in w.iter_mut().take(16).enumerate() {
            *word = u32::from_be_bytes([
                block[idx * 4],
                block[idx * 4 + 1],
                block[idx * 4 + 2],
                block[idx * 4 + 3],
            ]);
        }
        for idx in 16..80 {
            w[idx] = (w[idx - 3] ^ w[idx - 8] ^ w[idx - 14] ^ w[idx - 16]).rotate_left(1);
        }

        let (mut a, mut b, mut c, mut d, mut e) = (h0, h1, h2, h3, h4);

        #[allow(clippy::needless_range_loop)]
        for idx in 0..80 {
            let (f, k) = match idx {
                0..=19 => ((b & c) | ((!b) & d), 0x5A82_7999_u32),
                20..=39 => (b ^ c ^ d, 0x6ED9_EBA1_u32),
                40..=59 => ((b & c) | (b & d) | (c & d), 0x8F1B_BCDC_u32),
                _ => (b ^ c ^ d, 0xCA62_C1D6_u32),
            };

            let temp = a
                .rotate_left(5)
                .wrapping_add(f)
                .wrapping_add(e)
                .wrapping_add(k)
                .wrapping_add(w[idx]);
            e = d;
            d = c;
            c = b.rotate_left(30);
            b = a;
            a = temp;
        }

        h0 = h0.wrapping_add(a);
        h1 = h1.wrapping_add(b);
        h2 = h2.wrapping_add(c);
        h3 = h3.wrapping_add(d);
        h4 = h4.wrapping_add(e);
    }

    let mut result = [0u8; 20];
    result[0..4].copy_from_slice(&h0.to_be_bytes());
    result[4..8].copy_from_slice(&h1.to_be_bytes());
    result[8..12].copy_from_slice(&h2.to_be_bytes());
    result[12..16].copy_from_slice(&h3.to_be_bytes());
    result[16..20].copy_from_slice(&h4.to_be_bytes());
    result
}

// ============================================================================
// Base64 — encoding for the accept key, decoding to validate client keys
// ============================================================================

const BASE64_CHARS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = u32::from(chunk[0]);
        let b1 = chunk.get(1).copied().map_or(0, u32::from);
        let b2 = chunk.get(2).copied().map_or(0, u32::from);
        let triple = (b0 << 16) | (b1 << 8) | b2;

        result.push(BASE64_CHARS[((triple >> 18) & 0x3F) as usize] as char);
        result.push(BASE64_CHARS[((triple >> 12) & 0x3F) as usize] as char);
        if chunk.len() > 1 {
            result.push(BASE64_CHARS[((triple >> 6) & 0x3F) as usize] as char);
        } else {
            result.push('=');
        }
        if chunk.len() > 2 {
            result.push(BASE64_CHARS[(triple & 0x3F) as usize] as char);
        } else {
            result.push('=');
        }
    }
    result
}

fn base64_value(b: u8) -> Option<u32> {
    match b {
        b'A'..=b'Z' => Some(u32::from(b - b'A')),
        b'a'..=b'z' => Some(u32::from(b - b'a') + 26),
        b'0'..=b'9' => Some(u32::from(b - b'0') + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Decodes standard base64 with `=` padding. Returns `None` on any
/// malformed input; used only to validate `Sec-WebSocket-Key`.
fn base64_decode(s: &str) -> Option<Vec<u8>> {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(bytes.len() / 4 * 3);
    let last_chunk = bytes.len() / 4 - 1;
    for (index, chunk) in bytes.chunks_exact(4).enumerate() {
        let pad = chunk.iter().filter(|&&b| b == b'=').count();
        if pad > 2 || (pad > 0 && index != last_chunk) {
            return None;
        }
        if chunk[..4 - pad].iter().any(|&b| b == b'=') {
            return None;
        }
        let vals: Vec<u32> = chunk
            .iter()
            .take(4 - pad)
            .map(|&b| base64_value(b))
            .collect::<Option<_>>()?;
        let mut triple = 0u32;
        for (i, v) in vals.iter().enumerate() {
            triple |= v << (18 - 6 * i);
        }
        out.push((triple >> 16) as u8);
        if pad < 2 {
            out.push((triple >> 8) as u8);
        }
        if pad == 0 {
            out.push(triple as u8);
        }
    }
    Some(out)
}

// ============================================================================
// Handshake
// ============================================================================

/// The WebSocket GUID used in the handshake (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value from the client's
/// `Sec-WebSocket-Key` header (RFC 6455 §4.2.2 step 4).
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WS_GUID.len());
    input.push_str(client_key.trim());
    input.push_str(WS_GUID);
    base64_encode(&sha1(input.as_bytes()))
}

/// Validate a WebSocket upgrade request (RFC 6455 §4.2.1).
///
/// Checks the method, `Upgrade`/`Connection` tokens,
/// `Sec-WebSocket-Version: 13`, and that `Sec-WebSocket-Key` decodes to
/// 16 bytes. Returns the client key on success.
pub fn validate_upgrade(request: &Request) -> Result<String, FrameError> {
    if request.method() != Method::Get {
        return Err(FrameError::Handshake(
            "WebSocket upgrade requires GET".into(),
        ));
    }
    if !crate::connection::is_websocket_upgrade(request) {
        return Err(FrameError::Handshake(
            "missing Upgrade/Connection headers".into(),
        ));
    }

    let version = request
        .headers()
        .get_str("sec-websocket-version")
        .ok_or_else(|| FrameError::Handshake("missing Sec-WebSocket-Version".into()))?;
    if version.trim() != "13" {
        return Err(FrameError::Handshake(format!(
            "unsupported WebSocket version: {version}"
        )));
    }

    let key = request
        .headers()
        .get_str("sec-websocket-key")
        .ok_or_else(|| FrameError::Handshake("missing Sec-WebSocket-Key".into()))?
        .trim()
        .to_string();
    match base64_decode(&key) {
        Some(decoded) if decoded.len() == 16 => Ok(key),
        _ => Err(FrameError::Handshake(
            "Sec-WebSocket-Key must be base64 of 16 bytes".into(),
        )),
    }
}

/// Build the 101 Switching Protocols response for a validated upgrade.
#[must_use]
pub fn upgrade_response(client_key: &str) -> Response {
    Response::new(StatusCode::SWITCHING_PROTOCOLS)
        .header("Upgrade", b"websocket".to_vec())
        .header("Connection", b"Upgrade".to_vec())
        .header("Sec-WebSocket-Accept", accept_key(client_key).into_bytes())
}

// ============================================================================
// Types
// ============================================================================

/// WebSocket frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation frame (0x0).
    Continuation,
    /// Text frame (0x1) — payload must be valid UTF-8.
    Text,
    /// Binary frame (0x2).
    Binary,
    /// Connection close (0x8).
    Close,
    /// Ping (0x9).
    Ping,
    /// Pong (0xA).
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value & 0x0F {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::Protocol(format!("unknown opcode: 0x{other:X}"))),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Returns true for control frames (close, ping, pong).
    fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// WebSocket close status code (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal,
    /// Endpoint going away (1001).
    GoingAway,
    /// Protocol error (1002).
    ProtocolError,
    /// Unsupported data type (1003).
    UnsupportedData,
    /// Invalid payload data (1007).
    InvalidPayload,
    /// Policy violation (1008).
    PolicyViolation,
    /// Message too big (1009).
    MessageTooBig,
    /// Missing expected extension (1010).
    MandatoryExtension,
    /// Internal server error (1011).
    InternalError,
    /// Application-defined or registered code in the 3000-4999 range.
    Application(u16),
}

impl CloseCode {
    /// Convert to the 2-byte wire representation.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::Application(code) => code,
        }
    }

    /// Parse from a 2-byte wire value. Unknown values map to
    /// [`CloseCode::ProtocolError`].
    #[must_use]
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedData,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            3000..=4999 => Self::Application(code),
            _ => Self::ProtocolError,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_u16())
    }
}

fn is_valid_close_code(code: u16) -> bool {
    matches!(
        code,
        1000..=1003 | 1007..=1011 | 3000..=4999
    )
}

/// A WebSocket message, assembled from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
    /// Ping with payload (max 125 bytes).
    Ping(Vec<u8>),
    /// Pong with payload (max 125 bytes).
    Pong(Vec<u8>),
    /// Close with optional code and reason.
    Close(Option<CloseCode>, Option<String>),
}

/// WebSocket decode error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Protocol violation.
    Protocol(String),
    /// Frame or message exceeds the configured size limit.
    TooLarge {
        /// Offending size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },
    /// Invalid UTF-8 in a text message.
    InvalidUtf8,
    /// Upgrade handshake failed.
    Handshake(String),
}

impl FrameError {
    /// The close code this error maps to when tearing the connection down.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Protocol(_) | Self::Handshake(_) => CloseCode::ProtocolError,
            Self::TooLarge { .. } => CloseCode::MessageTooBig,
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
        }
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "WebSocket protocol error: {msg}"),
            Self::TooLarge { size, limit } => {
                write!(f, "WebSocket message too large: {size} bytes (limit: {limit})")
            }
            Self::InvalidUtf8 => write!(f, "WebSocket: invalid UTF-8 in text message"),
            Self::Handshake(msg) => write!(f, "WebSocket handshake failed: {msg}"),
        }
    }
}

impl std::error::Error for FrameError {}

// ============================================================================
// Frame decoder
// ============================================================================

/// A raw frame pulled off the buffer.
#[derive(Debug)]
struct Frame {
    fin: bool,
    opcode: Opcode,
    payload: Vec<u8>,
}

/// Incremental WebSocket frame decoder.
///
/// Push raw bytes in, poll complete [`Message`]s out. Fragmented data
/// messages are reassembled internally; each poll yields at most one
/// message and leaves surplus bytes buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    max_payload: usize,
    buf: Vec<u8>,
    fragment: Option<(Opcode, Vec<u8>)>,
}

impl FrameDecoder {
    /// Creates a decoder capping payloads and reassembled messages at
    /// `max_payload` bytes.
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            buf: Vec::new(),
            fragment: None,
        }
    }

    /// Appends raw bytes without decoding.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes currently buffered.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode one complete message.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn poll(&mut self) -> Result<Option<Message>, FrameError> {
        loop {
            let Some(frame) = self.parse_frame()? else {
                return Ok(None);
            };

            if frame.opcode.is_control() {
                return match frame.opcode {
                    Opcode::Close => {
                        let (code, reason) = parse_close_payload(&frame.payload)?;
                        Ok(Some(Message::Close(code, reason)))
                    }
                    Opcode::Ping => Ok(Some(Message::Ping(frame.payload))),
                    Opcode::Pong => Ok(Some(Message::Pong(frame.payload))),
                    _ => unreachable!(),
                };
            }

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    if self.fragment.is_some() {
                        return Err(FrameError::Protocol(
                            "new data frame while previous message is incomplete".into(),
                        ));
                    }
                    if frame.fin {
                        return Ok(Some(assemble(frame.opcode, frame.payload)?));
                    }
                    self.fragment = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let Some((opcode, mut data)) = self.fragment.take() else {
                        return Err(FrameError::Protocol(
                            "continuation frame without initial frame".into(),
                        ));
                    };
                    if data.len() + frame.payload.len() > self.max_payload {
                        return Err(FrameError::TooLarge {
                            size: data.len() + frame.payload.len(),
                            limit: self.max_payload,
                        });
                    }
                    data.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return Ok(Some(assemble(opcode, data)?));
                    }
                    self.fragment = Some((opcode, data));
                }
                _ => unreachable!(),
            }
        }
    }

    /// Pulls one complete frame off the buffer, or `None` if partial.
    fn parse_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let b0 = self.buf[0];
        let b1 = self.buf[1];

        let fin = (b0 & 0x80) != 0;
        if (b0 >> 4) & 0x07 != 0 {
            return Err(FrameError::Protocol(
                "reserved bits must be 0 (no extensions negotiated)".into(),
            ));
        }
        let opcode = Opcode::from_u8(b0)?;

        let masked = (b1 & 0x80) != 0;
        if !masked {
            return Err(FrameError::Protocol(
                "client-to-server frames must be masked".into(),
            ));
        }

        let len_byte = b1 & 0x7F;
        let (payload_len, len_field_len) = match len_byte {
            0..=125 => (u64::from(len_byte), 0usize),
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]])), 2)
            }
            _ => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&self.buf[2..10]);
                (u64::from_be_bytes(len_bytes), 8)
            }
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::Protocol(
                    "control frames must not be fragmented".into(),
                ));
            }
            if payload_len > 125 {
                return Err(FrameError::Protocol(
                    "control frame payload must not exceed 125 bytes".into(),
                ));
            }
        }

        if payload_len > self.max_payload as u64 {
            return Err(FrameError::TooLarge {
                size: usize::try_from(payload_len).unwrap_or(usize::MAX),
                limit: self.max_payload,
            });
        }
        let payload_len = payload_len as usize;

        let header_len = 2 + len_field_len + 4;
        let total = header_len + payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mask_start = 2 + len_field_len;
        let mut key = [0u8; 4];
        key.copy_from_slice(&self.buf[mask_start..mask_start + 4]);

        let mut payload = self.buf[header_len..total].to_vec();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }

        self.buf.drain(..total);

        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}

fn assemble(opcode: Opcode, data: Vec<u8>) -> Result<Message, FrameError> {
    match opcode {
        Opcode::Text => {
            let text = String::from_utf8(data).map_err(|_| FrameError::InvalidUtf8)?;
            Ok(Message::Text(text))
        }
        Opcode::Binary => Ok(Message::Binary(data)),
        _ => unreachable!(),
    }
}

/// Parse a close frame payload into (code, reason).
fn parse_close_payload(
    payload: &[u8],
) -> Result<(Option<CloseCode>, Option<String>), FrameError> {
    if payload.len() < 2 {
        if payload.is_empty() {
            return Ok((None, None));
        }
        return Err(FrameError::Protocol(
            "close frame payload must be empty or at least 2 bytes".into(),
        ));
    }
    let code_raw = u16::from_be_bytes([payload[0], payload[1]]);
    if !is_valid_close_code(code_raw) {
        return Err(FrameError::Protocol(format!(
            "invalid close code in close frame: {code_raw}"
        )));
    }
    let code = CloseCode::from_u16(code_raw);
    let reason = if payload.len() > 2 {
        Some(
            std::str::from_utf8(&payload[2..])
                .map_err(|_| FrameError::Protocol("close reason must be valid UTF-8".into()))?
                .to_string(),
        )
    } else {
        None
    };
    Ok((Some(code), reason))
}

// ============================================================================
// Frame encoding (server-to-client, unmasked)
// ============================================================================

/// Encode a single unmasked frame.
#[must_use]
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(10 + payload.len());
    out.push(0x80 | opcode.to_u8());

    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= 0xFFFF {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    Bytes::from(out)
}

/// Encode a close frame with code and reason (reason truncated to fit
/// the 125-byte control payload limit).
#[must_use]
pub fn encode_close(code: CloseCode, reason: &str) -> Bytes {
    let mut payload = Vec::with_capacity(2 + reason.len().min(123));
    payload.extend_from_slice(&code.to_u16().to_be_bytes());
    let mut end = reason.len().min(123);
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    encode_frame(Opcode::Close, &payload)
}
