//! Listener: a TCP port (IPv4 and IPv6 when both are available) or a UNIX
//! socket path, fanning accepted connections out to a user-supplied
//! `create` callback.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};

use crate::address::Address;
use crate::socket::{Socket, WeakSocket};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

enum Listener {
    /// At most one per IP family — [`resolve_bind_addrs`] dedupes to that.
    Tcp(Vec<TcpListener>),
    Unix(UnixListener),
}

struct Shared {
    listener: Option<Listener>,
    url: Address,
    remotes: Vec<WeakSocket>,
}

/// A listening socket. `SO_REUSEADDR` is implied by binding through
/// `tokio::net`, which sets it on TCP listeners by default on unix targets.
pub struct Server {
    inner: Rc<RefCell<Shared>>,
}

impl Server {
    pub async fn bind(address: &str) -> Result<Server, ServerError> {
        let mut url = Address::parse(address);
        let listener = if let Some(path) = &url.unix {
            let _ = std::fs::remove_file(path);
            Listener::Unix(UnixListener::bind(path).map_err(ServerError::Bind)?)
        } else {
            let host = url.host.clone();
            let port = url.port.unwrap_or(0);
            let mut listeners = Vec::new();
            let mut first_err = None;
            for addr in resolve_bind_addrs(&host, port).await {
                match TcpListener::bind(addr).await {
                    Ok(l) => listeners.push(l),
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            if listeners.is_empty() {
                return Err(ServerError::Bind(first_err.unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no usable address")
                })));
            }
            // Port 0 asks the OS to pick one; reflect what it actually chose
            // so `local_addr()` is usable for connecting back, not just the
            // request that was made.
            if let Ok(bound) = listeners[0].local_addr() {
                url.port = Some(bound.port());
            }
            Listener::Tcp(listeners)
        };
        Ok(Server {
            inner: Rc::new(RefCell::new(Shared { listener: Some(listener), url, remotes: Vec::new() })),
        })
    }

    pub fn local_addr(&self) -> Address {
        self.inner.borrow().url.clone()
    }

    /// Spawns the accept loop on the current `LocalSet`. Each accepted
    /// connection is handed to `create` immediately; the server only keeps a
    /// weak bookkeeping reference so [`Server::close`] can still be
    /// implemented without the server owning every remote outright.
    pub fn spawn_accept_loop<F>(&self, mut create: F)
    where
        F: FnMut(Socket) + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_local(async move {
            loop {
                let accepted = {
                    let listener = inner.borrow();
                    match listener.listener.as_ref() {
                        Some(Listener::Tcp(ls)) => Accepted::Tcp(accept_any(ls).await),
                        Some(Listener::Unix(l)) => Accepted::Unix(l.accept().await),
                        None => return,
                    }
                };
                let socket = match accepted {
                    Accepted::Tcp(Ok((stream, peer))) => {
                        let url = Address::parse(&format!("tcp://{peer}"));
                        Socket::from_tcp(stream, url, peer.to_string())
                    }
                    Accepted::Unix(Ok((stream, _))) => {
                        let url = inner.borrow().url.clone();
                        Socket::from_unix(stream, url, "unix-peer".to_string())
                    }
                    Accepted::Tcp(Err(_)) | Accepted::Unix(Err(_)) => continue,
                };
                socket.spawn_read_loop();
                inner.borrow_mut().remotes.push(socket.downgrade());
                create(socket);
            }
        });
    }

    /// Tears down the listener and, transitively, its remotes: every
    /// accepted connection still alive is closed, and dead weak entries are
    /// dropped along the way.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.listener = None;
        for remote in inner.remotes.drain(..) {
            if let Some(socket) = remote.upgrade() {
                socket.close();
            }
        }
    }
}

enum Accepted {
    Tcp(std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)>),
    Unix(std::io::Result<(tokio::net::UnixStream, tokio::net::unix::SocketAddr)>),
}

/// Resolves `host:port` to the addresses `bind` should listen on: one per IP
/// family, dropping duplicates past the first of each. An empty `host` (a
/// bare `:port`, or no host at all) means "every interface", which the OS
/// splits across the IPv4-any and IPv6-any wildcard addresses rather than a
/// single resolvable name.
async fn resolve_bind_addrs(host: &str, port: u16) -> Vec<std::net::SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    if host.is_empty() {
        return vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        ];
    }

    let Ok(resolved) = tokio::net::lookup_host((host, port)).await else {
        return Vec::new();
    };
    let mut v4 = None;
    let mut v6 = None;
    for addr in resolved {
        match addr {
            SocketAddr::V4(_) if v4.is_none() => v4 = Some(addr),
            SocketAddr::V6(_) if v6.is_none() => v6 = Some(addr),
            _ => {}
        }
    }
    v4.into_iter().chain(v6).collect()
}

/// Fans `accept()` out across every bound listener — typically one IPv4 and
/// one IPv6 listener, matching `resolve_bind_addrs`'s at-most-one-per-family
/// invariant.
async fn accept_any(
    listeners: &[TcpListener],
) -> std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)> {
    match listeners {
        [] => std::future::pending().await,
        [only] => only.accept().await,
        [a, b] => {
            tokio::select! {
                r = a.accept() => r,
                r = b.accept() => r,
            }
        }
        _ => unreachable!("resolve_bind_addrs returns at most one address per IP family"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_to_ephemeral_tcp_port_succeeds() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let server = Server::bind("127.0.0.1:0").await.expect("bind");
                server.close();
            })
            .await;
    }

    #[tokio::test]
    async fn bind_with_no_host_succeeds_via_wildcard_addresses() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let server = Server::bind(":0").await.expect("wildcard bind");
                server.close();
            })
            .await;
    }

    #[tokio::test]
    async fn resolve_bind_addrs_keeps_one_address_per_family() {
        let addrs = resolve_bind_addrs("", 12345).await;
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().any(std::net::SocketAddr::is_ipv4));
        assert!(addrs.iter().any(std::net::SocketAddr::is_ipv6));
    }
}
