//! Shared harness: binds a server that completes the websocket upgrade for
//! each accepted connection and forwards the resulting `Websocket` down a
//! channel, mirroring the upgrade dance `demos/echo_rpc` does by hand.

use std::cell::RefCell;
use std::rc::Rc;

use tokio::sync::mpsc;

use webloop::Loop;
use webloop::Server;
use webloop::http::UpgradeRequest;
use webloop::socket::Socket;
use webloop::websocket::{WebSocketConfig, Websocket};

pub async fn spawn_ws_server(loop_: Rc<Loop>) -> (Server, mpsc::UnboundedReceiver<Websocket>) {
    let server = Server::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let (tx, rx) = mpsc::unbounded_channel();
    server.spawn_accept_loop(move |socket| accept_upgrade(socket, loop_.clone(), tx.clone()));
    (server, rx)
}

pub fn server_addr(server: &Server) -> String {
    let url = server.local_addr();
    format!("{}:{}", url.host, url.port.unwrap_or(0))
}

fn accept_upgrade(socket: Socket, loop_: Rc<Loop>, accepted: mpsc::UnboundedSender<Websocket>) {
    let request = Rc::new(RefCell::new(UpgradeRequest::new()));
    let socket_for_cb = socket.clone();
    socket.set_raw_mode(Box::new(move |buf| loop {
        let Some(idx) = buf.iter().position(|&b| b == b'\n' || b == b'\r') else { return };
        let mut next_start = idx + 1;
        if buf[idx] == b'\r' && buf.get(idx + 1) == Some(&b'\n') {
            next_start = idx + 2;
        }
        let line = String::from_utf8_lossy(&buf[..idx]).into_owned();
        buf.drain(..next_start);

        let done = match request.borrow_mut().feed_line(&line) {
            Ok(done) => done,
            Err(_) => {
                socket_for_cb.close();
                return;
            }
        };
        if !done {
            continue;
        }

        let response = match request.borrow().upgrade_response() {
            Ok(response) => response,
            Err(_) => {
                socket_for_cb.close();
                return;
            }
        };
        let ws = Websocket::accept(socket_for_cb.clone(), loop_.clone(), WebSocketConfig::default(), buf);
        let _ = accepted.send(ws);
        let reply_socket = socket_for_cb.clone();
        tokio::task::spawn_local(async move {
            let _ = reply_socket.send(&response).await;
        });
        return;
    }));
}
