//! HTTP response writer.

use bytes::Bytes;
use hearth_core::{Response, StatusCode};

/// Serializes HTTP responses into wire bytes.
///
/// `Content-Length` is added automatically whenever the status permits a
/// body; callers should not set it themselves.
pub struct ResponseWriter {
    buffer: Vec<u8>,
}

impl ResponseWriter {
    /// Create a new response writer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Encode a response into a single buffer.
    pub fn encode(&mut self, response: &Response) -> Bytes {
        self.buffer.clear();

        // Status line
        self.buffer.extend_from_slice(b"HTTP/1.1 ");
        self.write_status(response.status());
        self.buffer.extend_from_slice(b"\r\n");

        // Headers
        for (name, value) in response.headers().iter() {
            self.buffer.extend_from_slice(name.as_bytes());
            self.buffer.extend_from_slice(b": ");
            self.buffer.extend_from_slice(value);
            self.buffer.extend_from_slice(b"\r\n");
        }

        let allows_body = response.status().allows_body();
        if allows_body {
            self.buffer.extend_from_slice(b"content-length: ");
            self.buffer
                .extend_from_slice(response.body_ref().len().to_string().as_bytes());
            self.buffer.extend_from_slice(b"\r\n");
        }

        // End of headers
        self.buffer.extend_from_slice(b"\r\n");

        if allows_body {
            self.buffer.extend_from_slice(response.body_ref());
        }

        Bytes::from(std::mem::take(&mut self.buffer))
    }

    fn write_status(&mut self, status: StatusCode) {
        self.buffer
            .extend_from_slice(status.as_u16().to_string().as_bytes());
        self.buffer.push(b' ');
        self.buffer
            .extend_from_slice(status.canonical_reason().as_bytes());
    }
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot convenience wrapper around [`ResponseWriter`].
#[must_use]
pub fn encode_response(response: &Response) -> Bytes {
    ResponseWriter::new().encode(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_status_line_headers_and_body() {
        let response = Response::ok()
            .header("Content-Type", b"text/plain".to_vec())
            .body("hi");
        let bytes = encode_response(&response);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn empty_body_still_has_content_length() {
        let bytes = encode_response(&Response::new(StatusCode::NOT_FOUND));
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
    }

    #[test]
    fn switching_protocols_has_no_content_length() {
        let response = Response::new(StatusCode::SWITCHING_PROTOCOLS)
            .header("Upgrade", b"websocket".to_vec());
        let text_bytes = encode_response(&response);
        let text = std::str::from_utf8(&text_bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(!text.contains("content-length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn writer_is_reusable() {
        let mut writer = ResponseWriter::new();
        let first = writer.encode(&Response::ok().body("a"));
        let second = writer.encode(&Response::ok().body("bb"));
        assert!(first.ends_with(b"\r\na"));
        assert!(second.ends_with(b"\r\nbb"));
    }
}
