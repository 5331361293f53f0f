//! Client handshake + server acceptance + frame codec + keepalive, composed
//! over a [`Socket`].

pub mod frame;
pub mod handshake;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::event_loop::{Handle as TimerHandle, Loop};
use crate::socket::{Socket, SocketError};
use frame::{Event, FrameDecoder, FrameError, OP_BINARY, OP_CLOSE, OP_PING, OP_PONG, OP_TEXT, encode_frame};
use handshake::{ClientHandshake, HandshakeError, build_request};

#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
}

#[derive(Debug, Clone, Default)]
pub struct WebSocketConfig {
    pub keepalive_interval: Option<Duration>,
    pub extra_headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

enum Phase {
    ClientHandshake(ClientHandshake),
    Frames,
}

type MessageCallback = Box<dyn FnMut(WsMessage)>;

struct Shared {
    socket: Socket,
    phase: Phase,
    decoder: FrameDecoder,
    mask_on_send: bool,
    pong_seen: bool,
    on_message: Option<MessageCallback>,
    pending_messages: Vec<WsMessage>,
    init_waiter: Option<oneshot::Sender<Result<(), WebSocketError>>>,
    keepalive_handle: Option<TimerHandle>,
}

/// A single websocket connection: client (mask-on-send) or server-accepted
/// (mask-on-receive), indistinguishable to callers once constructed.
#[derive(Clone)]
pub struct Websocket {
    inner: Rc<RefCell<Shared>>,
    loop_: Rc<Loop>,
}

impl Websocket {
    /// Connects as a client: sends the upgrade request, drives the
    /// `HTTP_START -> HTTP_HEADER -> HTTP_DONE` handshake, and only returns
    /// once it has succeeded or failed — there is no separate
    /// `wait_for_init()` step to call afterward in this translation.
    pub async fn connect(
        address: &str,
        loop_: Rc<Loop>,
        config: WebSocketConfig,
    ) -> Result<Websocket, WebSocketError> {
        let socket = Socket::connect(address).await?;
        let url = socket.url();
        let host =
            if let Some(port) = url.port { format!("{}:{}", url.host, port) } else { url.host.clone() };
        let path = if url.path.is_empty() { "/".to_string() } else { url.path.clone() };
        let auth = config.basic_auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
        let request = build_request(&host, &path, auth, &config.extra_headers);
        socket.send(&request).await?;

        let (tx, rx) = oneshot::channel();
        let shared = Rc::new(RefCell::new(Shared {
            socket: socket.clone(),
            phase: Phase::ClientHandshake(ClientHandshake::new()),
            decoder: FrameDecoder::new(false),
            mask_on_send: true,
            pong_seen: true,
            on_message: None,
            pending_messages: Vec::new(),
            init_waiter: Some(tx),
            keepalive_handle: None,
        }));
        let ws = Websocket { inner: shared, loop_: loop_.clone() };

        let ws_cb = ws.clone();
        socket.set_raw_mode(Box::new(move |buf| ws_cb.on_bytes(buf)));
        socket.spawn_read_loop();

        rx.await.map_err(|_| WebSocketError::Socket(SocketError::Closed))??;
        if let Some(interval) = config.keepalive_interval {
            ws.start_keepalive(interval);
        }
        Ok(ws)
    }

    /// Wraps an already-upgraded, server-accepted socket. Starts directly
    /// in frame-decoding mode (no handshake to drive — the HTTP layer
    /// already sent the 101 response); masks are required on receive.
    ///
    /// `leftover` is whatever bytes the HTTP layer's own raw-mode callback
    /// had already read past the blank line ending the request headers —
    /// a frame can arrive piggybacked in the same TCP segment. It is
    /// decoded immediately, synchronously, before this returns, rather than
    /// being merged into the socket's buffer and then lost: at the moment
    /// this runs we're still inside the HTTP callback's own invocation, and
    /// installing a new raw-mode callback here does not replay what's
    /// already been read. Any message this decodes arrives before the
    /// caller has had a chance to call [`Websocket::on_message`], so it is
    /// queued and delivered as soon as that callback is installed.
    pub fn accept(socket: Socket, loop_: Rc<Loop>, config: WebSocketConfig, leftover: &mut Vec<u8>) -> Websocket {
        let shared = Rc::new(RefCell::new(Shared {
            socket: socket.clone(),
            phase: Phase::Frames,
            decoder: FrameDecoder::new(true),
            mask_on_send: false,
            pong_seen: true,
            on_message: None,
            pending_messages: Vec::new(),
            init_waiter: None,
            keepalive_handle: None,
        }));
        let ws = Websocket { inner: shared, loop_: loop_.clone() };
        ws.decode_and_dispatch_frames(leftover);
        let ws_cb = ws.clone();
        socket.set_raw_mode(Box::new(move |buf| ws_cb.on_bytes(buf)));
        if let Some(interval) = config.keepalive_interval {
            ws.start_keepalive(interval);
        }
        ws
    }

    /// Installs the message callback, immediately delivering (in order) any
    /// messages that were queued because they arrived before this was
    /// called — notably ones decoded from [`Websocket::accept`]'s `leftover`
    /// bytes.
    pub fn on_message(&self, cb: impl FnMut(WsMessage) + 'static) {
        let mut cb: MessageCallback = Box::new(cb);
        let queued = std::mem::take(&mut self.inner.borrow_mut().pending_messages);
        for msg in queued {
            cb(msg);
        }
        self.inner.borrow_mut().on_message = Some(cb);
    }

    /// Forwards to the underlying socket's disconnect callback — fired on
    /// EOF, a read error, or a close handshake completing.
    pub fn on_disconnect(&self, cb: impl FnMut() + 'static) {
        self.socket_ref().on_disconnect(Box::new(cb));
    }

    pub async fn send_text(&self, text: &str) -> Result<(), WebSocketError> {
        let mask = self.send_mask();
        let frame = encode_frame(OP_TEXT, text.as_bytes(), mask);
        self.socket_ref().send(&frame).await.map_err(WebSocketError::from)
    }

    pub async fn send_binary(&self, bytes: &[u8]) -> Result<(), WebSocketError> {
        let mask = self.send_mask();
        let frame = encode_frame(OP_BINARY, bytes, mask);
        self.socket_ref().send(&frame).await.map_err(WebSocketError::from)
    }

    pub fn close(&self) {
        if let Some(handle) = self.inner.borrow_mut().keepalive_handle.take() {
            self.loop_.remove_timeout(handle);
        }
        self.socket_ref().close();
    }

    fn socket_ref(&self) -> Socket {
        self.inner.borrow().socket.clone()
    }

    fn send_mask(&self) -> Option<[u8; 4]> {
        if self.inner.borrow().mask_on_send { Some([0, 0, 0, 0]) } else { None }
    }

    /// The installed raw-mode callback: drives the client handshake line by
    /// line, then falls through in the same invocation to frame decoding —
    /// this is what lets a piggybacked frame arriving in the same TCP
    /// segment as the handshake's trailing blank line get delivered
    /// immediately instead of waiting for the next read.
    fn on_bytes(&self, buf: &mut Vec<u8>) {
        loop {
            let still_handshaking = matches!(self.inner.borrow().phase, Phase::ClientHandshake(_));
            if !still_handshaking {
                self.decode_and_dispatch_frames(buf);
                return;
            }

            let Some(line_bytes) = extract_line(buf) else { return };
            let line = String::from_utf8_lossy(&line_bytes).into_owned();
            let outcome = {
                let mut inner = self.inner.borrow_mut();
                let Phase::ClientHandshake(hs) = &mut inner.phase else { unreachable!() };
                match hs.feed_line(&line) {
                    Ok(true) => Some(hs.verify().map_err(WebSocketError::from)),
                    Ok(false) => None,
                    Err(e) => Some(Err(WebSocketError::from(e))),
                }
            };
            let Some(result) = outcome else { continue };
            self.inner.borrow_mut().phase = Phase::Frames;
            let failed = result.is_err();
            if let Some(tx) = self.inner.borrow_mut().init_waiter.take() {
                let _ = tx.send(result);
            }
            if failed {
                self.socket_ref().close();
                return;
            }
            // loop again: remaining bytes in `buf` are frame data now.
        }
    }

    fn decode_and_dispatch_frames(&self, buf: &mut Vec<u8>) {
        loop {
            let event = {
                let mut inner = self.inner.borrow_mut();
                // Long packets should not cause ping timeouts: any attempt to
                // decode with bytes buffered counts as activity, even if it
                // doesn't yet add up to a complete frame.
                if !buf.is_empty() {
                    inner.pong_seen = true;
                }
                match inner.decoder.decode_one(buf) {
                    Ok(Some(event)) => event,
                    Ok(None) => return,
                    Err(e) => {
                        drop(inner);
                        warn!(error = %e, "websocket protocol violation, closing");
                        self.socket_ref().close();
                        return;
                    }
                }
            };
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Message { opcode, payload } => {
                let message = if opcode == OP_TEXT {
                    WsMessage::Text(String::from_utf8_lossy(&payload).into_owned())
                } else {
                    WsMessage::Binary(payload)
                };
                let cb = self.inner.borrow_mut().on_message.take();
                match cb {
                    Some(mut f) => {
                        f(message);
                        let mut inner = self.inner.borrow_mut();
                        if inner.on_message.is_none() {
                            inner.on_message = Some(f);
                        }
                    }
                    None => self.inner.borrow_mut().pending_messages.push(message),
                }
            }
            Event::Ping(payload) => {
                let socket = self.socket_ref();
                let mask = self.send_mask();
                let frame = encode_frame(OP_PONG, &payload, mask);
                tokio::task::spawn_local(async move {
                    let _ = socket.send(&frame).await;
                });
            }
            Event::Pong => {}
            Event::Close(payload) => {
                let socket = self.socket_ref();
                let mask = self.send_mask();
                let frame = encode_frame(OP_CLOSE, &payload, mask);
                tokio::task::spawn_local(async move {
                    let _ = socket.send(&frame).await;
                    socket.close();
                });
            }
        }
    }

    fn start_keepalive(&self, interval: Duration) {
        let ws = self.clone();
        let deadline = tokio::time::Instant::now() + interval;
        let handle = self.loop_.register_timeout(
            deadline,
            interval,
            Box::new(move || {
                let (socket, mask, was_silent) = {
                    let mut inner = ws.inner.borrow_mut();
                    let was_silent = !inner.pong_seen;
                    inner.pong_seen = false;
                    let mask = if inner.mask_on_send { Some([0, 0, 0, 0]) } else { None };
                    (inner.socket.clone(), mask, was_silent)
                };
                if was_silent {
                    warn!(name = %socket.name(), "keepalive: no pong since last ping");
                }
                let frame = encode_frame(OP_PING, &[], mask);
                tokio::task::spawn_local(async move {
                    let _ = socket.send(&frame).await;
                });
                true
            }),
        );
        self.inner.borrow_mut().keepalive_handle = Some(handle);
    }
}

fn extract_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let idx = buf.iter().position(|&b| b == b'\n' || b == b'\r')?;
    let mut next_start = idx + 1;
    if buf[idx] == b'\r' && buf.get(idx + 1) == Some(&b'\n') {
        next_start = idx + 2;
    }
    let line = buf[..idx].to_vec();
    buf.drain(..next_start);
    Some(line)
}
