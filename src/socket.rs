//! Stream socket abstraction over TCP, UNIX-domain, and (transparently,
//! since `tokio::net::TcpStream` already dual-stacks) IPv6.
//!
//! Byte transport uses `tokio::net` directly rather than routing through
//! [`crate::event_loop::Loop`]'s raw-fd registry — both already multiplex
//! on the same current-thread reactor, so a second registration layer would
//! just duplicate bookkeeping.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use crate::address::Address;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
    #[error("socket is closed")]
    Closed,
}

/// Which of the three mutually-exclusive read modes is active. Switching
/// modes flushes whatever is already buffered back through the new mode's
/// dispatch rule before new bytes are read.
pub enum ReadMode {
    /// Callback fires whenever the fd is readable; it must drain the bytes
    /// it wants, leaving the rest for the next delivery.
    Raw,
    /// Delivers up to `maxsize` bytes per callback invocation.
    Chunked { maxsize: usize },
    /// Delivers one line at a time (terminator stripped), for `\r\n`, `\n`,
    /// or bare `\r`.
    Line,
}

pub type RawCallback = Box<dyn FnMut(&mut Vec<u8>)>;
pub type DisconnectCallback = Box<dyn FnMut()>;
pub type ErrorCallback = Box<dyn FnMut(&SocketError)>;

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf).await,
            Stream::Unix(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf).await,
            Stream::Unix(s) => s.write_all(buf).await,
        }
    }
}

struct Shared {
    stream: Option<Stream>,
    pending: Vec<u8>,
    mode: ReadMode,
    on_raw: Option<RawCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_error: Option<ErrorCallback>,
    name: String,
    url: Address,
}

/// A connected stream socket. Cloning shares the same underlying connection
/// (callbacks, buffered bytes, and all); there is exactly one owner of the
/// read loop per socket regardless of how many `Socket` handles exist.
#[derive(Clone)]
pub struct Socket {
    inner: Rc<RefCell<Shared>>,
}

impl Socket {
    pub async fn connect(address: &str) -> Result<Socket, SocketError> {
        let url = Address::parse(address);
        let stream = if let Some(path) = &url.unix {
            Stream::Unix(UnixStream::connect(path).await.map_err(SocketError::Connect)?)
        } else {
            let host = url.host.clone();
            let port = url.port.unwrap_or(80);
            Stream::Tcp(TcpStream::connect((host.as_str(), port)).await.map_err(SocketError::Connect)?)
        };
        Ok(Socket::from_stream(stream, url, address.to_string()))
    }

    pub(crate) fn from_tcp(stream: TcpStream, url: Address, name: String) -> Socket {
        Socket::from_stream(Stream::Tcp(stream), url, name)
    }

    pub(crate) fn from_unix(stream: UnixStream, url: Address, name: String) -> Socket {
        Socket::from_stream(Stream::Unix(stream), url, name)
    }

    fn from_stream(stream: Stream, url: Address, name: String) -> Socket {
        Socket {
            inner: Rc::new(RefCell::new(Shared {
                stream: Some(stream),
                pending: Vec::new(),
                mode: ReadMode::Raw,
                on_raw: None,
                on_disconnect: None,
                on_error: None,
                name,
                url,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn url(&self) -> Address {
        self.inner.borrow().url.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().stream.is_none()
    }

    pub fn on_disconnect(&self, cb: DisconnectCallback) {
        self.inner.borrow_mut().on_disconnect = Some(cb);
    }

    pub fn on_error(&self, cb: ErrorCallback) {
        self.inner.borrow_mut().on_error = Some(cb);
    }

    /// Installs a raw-mode read callback: called with whatever bytes are
    /// currently pending every time more arrive. The callback drains what it
    /// wants from the front of the buffer and leaves the rest.
    pub fn set_raw_mode(&self, cb: RawCallback) {
        let mut inner = self.inner.borrow_mut();
        inner.mode = ReadMode::Raw;
        inner.on_raw = Some(cb);
        drop(inner);
        self.dispatch_pending();
    }

    /// Chunked mode: the callback receives up to `maxsize` bytes at a time.
    pub fn set_chunked_mode(&self, maxsize: usize, mut cb: impl FnMut(&[u8]) + 'static) {
        let raw: RawCallback = Box::new(move |buf| {
            let take = buf.len().min(maxsize);
            if take == 0 {
                return;
            }
            let chunk: Vec<u8> = buf.drain(..take).collect();
            cb(&chunk);
        });
        let mut inner = self.inner.borrow_mut();
        inner.mode = ReadMode::Chunked { maxsize };
        inner.on_raw = Some(raw);
        drop(inner);
        self.dispatch_pending();
    }

    /// Line mode: delivers each line with its `\r\n`/`\n`/`\r` terminator
    /// stripped, repeatedly, until no newline remains in the buffer.
    pub fn set_line_mode(&self, mut cb: impl FnMut(&[u8]) + 'static) {
        let raw: RawCallback = Box::new(move |buf| loop {
            let Some(idx) = buf.iter().position(|&b| b == b'\n' || b == b'\r') else { break };
            let mut next_start = idx + 1;
            if buf[idx] == b'\r' && buf.get(idx + 1) == Some(&b'\n') {
                next_start = idx + 2;
            }
            let line: Vec<u8> = buf[..idx].to_vec();
            buf.drain(..next_start);
            cb(&line);
        });
        let mut inner = self.inner.borrow_mut();
        inner.mode = ReadMode::Line;
        inner.on_raw = Some(raw);
        drop(inner);
        self.dispatch_pending();
    }

    /// Invokes the active read-mode callback with whatever bytes are
    /// pending. The callback is pulled out of the `RefCell` before being
    /// called — and the buffer taken with it — so a callback that itself
    /// calls back into this `Socket` (sending a reply, switching modes)
    /// never re-enters an already-borrowed cell.
    fn dispatch_pending(&self) {
        let (mut pending, mut cb) = {
            let mut inner = self.inner.borrow_mut();
            if inner.pending.is_empty() {
                return;
            }
            (std::mem::take(&mut inner.pending), inner.on_raw.take())
        };
        if let Some(f) = cb.as_mut() {
            f(&mut pending);
        }
        let mut inner = self.inner.borrow_mut();
        if inner.on_raw.is_none() {
            inner.on_raw = cb;
        }
        pending.extend(std::mem::take(&mut inner.pending));
        inner.pending = pending;
    }

    /// Writes every byte, retrying on short writes; suspends the caller
    /// (rather than busy-looping) when the socket isn't ready for more.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), SocketError> {
        let stream = {
            let mut inner = self.inner.borrow_mut();
            inner.stream.take()
        };
        let Some(mut stream) = stream else {
            return Err(SocketError::Closed);
        };
        let result = stream.write_all(bytes).await;
        self.inner.borrow_mut().stream = Some(stream);
        result.map_err(|e| {
            let err = SocketError::Io(e);
            self.fail(&err);
            err
        })
    }

    fn fail(&self, err: &SocketError) {
        let mut inner = self.inner.borrow_mut();
        if let Some(cb) = inner.on_error.as_mut() {
            cb(err);
        }
    }

    /// Spawns the background read loop on the current `LocalSet`, delivering
    /// bytes to whichever read mode is active and invoking the disconnect
    /// callback on EOF or unrecoverable read error.
    pub fn spawn_read_loop(&self) {
        let socket = self.clone();
        tokio::task::spawn_local(async move {
            let mut buf = [0u8; 8192];
            loop {
                let mut stream = {
                    let mut inner = socket.inner.borrow_mut();
                    match inner.stream.take() {
                        Some(s) => s,
                        None => return,
                    }
                };
                let n = stream.read(&mut buf).await;
                socket.inner.borrow_mut().stream = Some(stream);

                match n {
                    Ok(0) => {
                        socket.close_with_disconnect();
                        return;
                    }
                    Ok(n) => {
                        socket.inner.borrow_mut().pending.extend_from_slice(&buf[..n]);
                        socket.dispatch_pending();
                    }
                    Err(e) => {
                        let err = SocketError::Io(e);
                        socket.fail(&err);
                        socket.close_with_disconnect();
                        return;
                    }
                }
            }
        });
    }

    fn close_with_disconnect(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.stream = None;
        if let Some(cb) = inner.on_disconnect.as_mut() {
            cb();
        }
    }

    pub fn close(&self) {
        self.close_with_disconnect();
    }

    pub fn downgrade(&self) -> WeakSocket {
        WeakSocket(Rc::downgrade(&self.inner))
    }
}

/// A non-owning reference to a [`Socket`], used by [`crate::server::Server`]
/// to track its accepted remotes without keeping them alive itself.
#[derive(Clone)]
pub struct WeakSocket(std::rc::Weak<RefCell<Shared>>);

impl WeakSocket {
    pub fn upgrade(&self) -> Option<Socket> {
        self.0.upgrade().map(|inner| Socket { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        Address::parse("tcp://localhost:0")
    }

    fn dummy_shared() -> Rc<RefCell<Shared>> {
        Rc::new(RefCell::new(Shared {
            stream: None,
            pending: Vec::new(),
            mode: ReadMode::Raw,
            on_raw: None,
            on_disconnect: None,
            on_error: None,
            name: "test".into(),
            url: addr(),
        }))
    }

    #[test]
    fn line_mode_splits_on_lf_cr_and_crlf() {
        let socket = Socket { inner: dummy_shared() };
        let lines = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
        let collected = lines.clone();
        socket.set_line_mode(move |l| collected.borrow_mut().push(l.to_vec()));
        socket.inner.borrow_mut().pending = b"one\r\ntwo\nthree\rfour".to_vec();
        socket.dispatch_pending();
        let got: Vec<String> =
            lines.borrow().iter().map(|l| String::from_utf8_lossy(l).into_owned()).collect();
        assert_eq!(got, vec!["one", "two", "three"]);
        assert_eq!(socket.inner.borrow().pending, b"four");
    }

    #[test]
    fn chunked_mode_delivers_at_most_maxsize_bytes() {
        let socket = Socket { inner: dummy_shared() };
        let chunks = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
        let collected = chunks.clone();
        socket.set_chunked_mode(3, move |c| collected.borrow_mut().push(c.to_vec()));
        socket.inner.borrow_mut().pending = b"abcdef".to_vec();
        socket.dispatch_pending();
        assert_eq!(chunks.borrow()[0], b"abc");
    }

    #[test]
    fn switching_modes_flushes_pending_bytes() {
        let socket = Socket { inner: dummy_shared() };
        socket.inner.borrow_mut().pending = b"hello\n".to_vec();
        let lines = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
        let collected = lines.clone();
        socket.set_line_mode(move |l| collected.borrow_mut().push(l.to_vec()));
        assert_eq!(lines.borrow().len(), 1);
    }
}
