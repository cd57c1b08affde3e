//! HTTP Connection header handling.
//!
//! Parses the comma-separated token list of the `Connection` header per
//! RFC 7230 and derives the two per-request bits the server cares about:
//!
//! - keep-alive, with HTTP version-aware defaults
//! - upgrade, combined with the `Upgrade` header for WebSocket detection

use hearth_core::{HttpVersion, Request};

/// Parsed Connection header directives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionInfo {
    /// Whether the `close` token was present.
    pub close: bool,
    /// Whether the `keep-alive` token was present.
    pub keep_alive: bool,
    /// Whether the `upgrade` token was present.
    pub upgrade: bool,
}

impl ConnectionInfo {
    /// Parses a Connection header value.
    ///
    /// Tokens are case-insensitive; whitespace around commas is ignored.
    /// Unknown tokens (hop-by-hop header names) are skipped.
    #[must_use]
    pub fn parse(value: &[u8]) -> Self {
        let mut info = Self::default();

        let Ok(value_str) = std::str::from_utf8(value) else {
            return info;
        };

        for token in value_str.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                info.close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                info.keep_alive = true;
            } else if token.eq_ignore_ascii_case("upgrade") {
                info.upgrade = true;
            }
        }

        info
    }

    /// Whether the connection should be kept alive for this version.
    ///
    /// - explicit `close` always wins
    /// - explicit `keep-alive` always wins
    /// - otherwise HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close
    #[must_use]
    pub fn should_keep_alive(&self, version: HttpVersion) -> bool {
        if self.close {
            return false;
        }
        if self.keep_alive {
            return true;
        }
        version.is_http11()
    }
}

/// Determines whether a request's connection should be kept alive.
#[must_use]
pub fn should_keep_alive(request: &Request) -> bool {
    let info = request
        .headers()
        .get("connection")
        .map_or_else(ConnectionInfo::default, ConnectionInfo::parse);
    info.should_keep_alive(request.version())
}

/// Detects a WebSocket upgrade request: `Connection: upgrade` combined
/// with `Upgrade: websocket` (both token lists, case-insensitive).
#[must_use]
pub fn is_websocket_upgrade(request: &Request) -> bool {
    let info = request
        .headers()
        .get("connection")
        .map_or_else(ConnectionInfo::default, ConnectionInfo::parse);
    if !info.upgrade {
        return false;
    }
    request.headers().get_str("upgrade").is_some_and(|value| {
        value
            .split(',')
            .any(|v| v.trim().eq_ignore_ascii_case("websocket"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::Method;

    #[test]
    fn parse_single_tokens() {
        assert!(ConnectionInfo::parse(b"close").close);
        assert!(ConnectionInfo::parse(b"keep-alive").keep_alive);
        assert!(ConnectionInfo::parse(b"upgrade").upgrade);
    }

    #[test]
    fn parse_multiple_tokens_with_whitespace() {
        let info = ConnectionInfo::parse(b"  keep-alive ,  Upgrade ");
        assert!(info.keep_alive);
        assert!(info.upgrade);
        assert!(!info.close);
    }

    #[test]
    fn parse_case_insensitive() {
        assert!(ConnectionInfo::parse(b"CLOSE").close);
        assert!(ConnectionInfo::parse(b"Keep-Alive").keep_alive);
    }

    #[test]
    fn parse_invalid_utf8_is_empty() {
        let info = ConnectionInfo::parse(&[0xFF, 0xFE]);
        assert!(!info.close && !info.keep_alive && !info.upgrade);
    }

    #[test]
    fn keep_alive_version_defaults() {
        let info = ConnectionInfo::default();
        assert!(info.should_keep_alive(HttpVersion::Http11));
        assert!(!info.should_keep_alive(HttpVersion::Http10));
    }

    #[test]
    fn keep_alive_close_overrides() {
        let info = ConnectionInfo::parse(b"keep-alive, close");
        assert!(!info.should_keep_alive(HttpVersion::Http11));
    }

    #[test]
    fn http10_explicit_keep_alive() {
        let mut request = Request::with_version(Method::Get, "/", HttpVersion::Http10);
        request.headers_mut().insert("Connection", b"keep-alive".to_vec());
        assert!(should_keep_alive(&request));
    }

    #[test]
    fn upgrade_needs_both_headers() {
        let mut request = Request::new(Method::Get, "/ws");
        request.headers_mut().insert("Connection", b"Upgrade".to_vec());
        assert!(!is_websocket_upgrade(&request));

        request.headers_mut().insert("Upgrade", b"websocket".to_vec());
        assert!(is_websocket_upgrade(&request));
    }

    #[test]
    fn upgrade_token_lists() {
        let mut request = Request::new(Method::Get, "/ws");
        request
            .headers_mut()
            .insert("Connection", b"keep-alive, Upgrade".to_vec());
        request
            .headers_mut()
            .insert("Upgrade", b"h2c, WebSocket".to_vec());
        assert!(is_websocket_upgrade(&request));
    }
}
