//! Client handshake state machine and the server's `Sec-WebSocket-Accept`
//! computation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed rather than randomly generated: the key's randomness carries no
/// security value here and the counterpart server never verifies it.
pub const CLIENT_KEY: &str = "AQIDBAUGBwgJCgsMDQ4PEC==";

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    let digest = hasher.finalize();
    BASE64.encode(digest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Inactive,
    Start,
    Header,
    Done,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed status line: {0}")]
    BadStatusLine(String),
    #[error("server did not return 101 Switching Protocols (got {0})")]
    NotSwitchingProtocols(u16),
    #[error("Sec-WebSocket-Accept mismatch")]
    AcceptMismatch,
}

/// Builds the client's upgrade request. `extra_headers` are appended
/// verbatim; `auth` is an optional `user:password` pair encoded as HTTP
/// Basic.
pub fn build_request(
    host: &str,
    path: &str,
    auth: Option<(&str, &str)>,
    extra_headers: &[(String, String)],
) -> Vec<u8> {
    let mut req = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {CLIENT_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    if let Some((user, pass)) = auth {
        let token = BASE64.encode(format!("{user}:{pass}"));
        req.push_str(&format!("Authorization: Basic {token}\r\n"));
    }
    for (k, v) in extra_headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    req.push_str("\r\n");
    req.into_bytes()
}

/// Drives `HTTP_INACTIVE -> HTTP_START -> HTTP_HEADER -> HTTP_DONE` by
/// consuming complete lines (the caller is expected to be in line mode while
/// this machine is active). Any bytes arriving after the blank line that
/// ends the headers belong to the frame parser, not here.
pub struct ClientHandshake {
    state: ClientState,
    status_code: u16,
    headers: Vec<(String, String)>,
}

impl ClientHandshake {
    pub fn new() -> Self {
        ClientHandshake { state: ClientState::Start, status_code: 0, headers: Vec::new() }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Feeds one line (terminator already stripped). Returns `Ok(true)` once
    /// the handshake completes (`HTTP_DONE`), at which point
    /// [`ClientHandshake::verify`] should be called.
    pub fn feed_line(&mut self, line: &str) -> Result<bool, HandshakeError> {
        match self.state {
            ClientState::Start => {
                let mut parts = line.splitn(3, ' ');
                let _version = parts.next();
                let code = parts.next().unwrap_or("");
                let code: u16 =
                    code.parse().map_err(|_| HandshakeError::BadStatusLine(line.to_string()))?;
                self.status_code = code;
                self.state = ClientState::Header;
                Ok(false)
            }
            ClientState::Header => {
                if line.is_empty() {
                    self.state = ClientState::Done;
                    return Ok(true);
                }
                if let Some((k, v)) = line.split_once(':') {
                    self.headers.push((k.trim().to_ascii_lowercase(), v.trim().to_string()));
                }
                Ok(false)
            }
            ClientState::Done | ClientState::Inactive => Ok(true),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str())
    }

    /// Checks the status code and `Sec-WebSocket-Accept` once `HTTP_DONE`
    /// is reached.
    pub fn verify(&self) -> Result<(), HandshakeError> {
        if self.status_code != 101 {
            return Err(HandshakeError::NotSwitchingProtocols(self.status_code));
        }
        let expected = compute_accept_key(CLIENT_KEY);
        match self.header("sec-websocket-accept") {
            Some(actual) if actual == expected => Ok(()),
            _ => Err(HandshakeError::AcceptMismatch),
        }
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the server's 101 response for an accepted upgrade request whose
/// `Sec-WebSocket-Key` header value is `client_key`.
pub fn build_response(client_key: &str) -> Vec<u8> {
    let accept = compute_accept_key(client_key);
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_6455_example() {
        // The example from RFC 6455 section 1.3.
        assert_eq!(compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn client_handshake_accepts_matching_101_response() {
        let mut hs = ClientHandshake::new();
        let accept = compute_accept_key(CLIENT_KEY);
        assert!(!hs.feed_line("HTTP/1.1 101 Switching Protocols").unwrap());
        assert!(!hs.feed_line("Upgrade: websocket").unwrap());
        assert!(!hs.feed_line(&format!("Sec-WebSocket-Accept: {accept}")).unwrap());
        assert!(hs.feed_line("").unwrap());
        assert_eq!(hs.state(), ClientState::Done);
        hs.verify().unwrap();
    }

    #[test]
    fn client_handshake_rejects_non_101_status() {
        let mut hs = ClientHandshake::new();
        hs.feed_line("HTTP/1.1 404 Not Found").unwrap();
        hs.feed_line("").unwrap();
        assert!(matches!(hs.verify(), Err(HandshakeError::NotSwitchingProtocols(404))));
    }
}
