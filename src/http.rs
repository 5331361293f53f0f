//! The upgrade-only slice of the HTTP connection layer: just enough
//! request-line/header parsing to recognize a websocket upgrade request and
//! build the 101 response. Static-file serving, MIME detection, and
//! multipart decoding are collaborators out of scope here.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::websocket::handshake::build_response;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request line: {0}")]
    BadRequestLine(String),
    #[error("not a websocket upgrade request")]
    NotAnUpgrade,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Header,
    Done,
}

/// An incoming request's method/path and the headers collected so far.
/// Basic auth, if present, is decoded into `basic_auth`.
pub struct UpgradeRequest {
    state: State,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    pub fn new() -> Self {
        UpgradeRequest {
            state: State::RequestLine,
            method: String::new(),
            path: String::new(),
            headers: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str())
    }

    /// Decodes `Authorization: Basic <base64>` into a `(user, password)`
    /// pair, if present and well-formed.
    pub fn basic_auth(&self) -> Option<(String, String)> {
        let value = self.header("authorization")?;
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = BASE64.decode(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }

    /// Feeds one line (terminator already stripped). Returns `Ok(true)` once
    /// the blank line ending the headers is seen.
    pub fn feed_line(&mut self, line: &str) -> Result<bool, HttpError> {
        match self.state {
            State::RequestLine => {
                let mut parts = line.splitn(3, ' ');
                let method = parts.next().unwrap_or("");
                let path = parts.next().unwrap_or("");
                if method.is_empty() || path.is_empty() {
                    return Err(HttpError::BadRequestLine(line.to_string()));
                }
                self.method = method.to_string();
                self.path = path.to_string();
                self.state = State::Header;
                Ok(false)
            }
            State::Header => {
                if line.is_empty() {
                    self.state = State::Done;
                    return Ok(true);
                }
                if let Some((k, v)) = line.split_once(':') {
                    self.headers.push((k.trim().to_ascii_lowercase(), v.trim().to_string()));
                }
                Ok(false)
            }
            State::Done => Ok(true),
        }
    }

    /// True once the method/headers name a websocket upgrade: `GET` with
    /// `Upgrade: websocket` and a `Sec-WebSocket-Key`.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
            && self.header("upgrade").map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false)
            && self.header("sec-websocket-key").is_some()
    }

    /// Builds the `101 Switching Protocols` response bytes for this request.
    pub fn upgrade_response(&self) -> Result<Vec<u8>, HttpError> {
        if !self.is_websocket_upgrade() {
            return Err(HttpError::NotAnUpgrade);
        }
        let key = self.header("sec-websocket-key").ok_or(HttpError::MissingKey)?;
        Ok(build_response(key))
    }
}

impl Default for UpgradeRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_a_websocket_upgrade_request() {
        let mut req = UpgradeRequest::new();
        assert!(!req.feed_line("GET /chat HTTP/1.1").unwrap());
        assert!(!req.feed_line("Host: example.com").unwrap());
        assert!(!req.feed_line("Upgrade: websocket").unwrap());
        assert!(!req.feed_line("Connection: Upgrade").unwrap());
        assert!(!req.feed_line("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==").unwrap());
        assert!(req.feed_line("").unwrap());
        assert!(req.is_websocket_upgrade());
        assert_eq!(req.path(), "/chat");
    }

    #[test]
    fn plain_get_is_not_an_upgrade() {
        let mut req = UpgradeRequest::new();
        req.feed_line("GET /index.html HTTP/1.1").unwrap();
        req.feed_line("").unwrap();
        assert!(!req.is_websocket_upgrade());
        assert!(matches!(req.upgrade_response(), Err(HttpError::NotAnUpgrade)));
    }

    #[test]
    fn decodes_basic_auth_header() {
        let mut req = UpgradeRequest::new();
        req.feed_line("GET / HTTP/1.1").unwrap();
        req.feed_line("Authorization: Basic dXNlcjpwYXNz").unwrap();
        req.feed_line("").unwrap();
        assert_eq!(req.basic_auth(), Some(("user".to_string(), "pass".to_string())));
    }
}
