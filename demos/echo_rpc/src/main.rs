//! Two-process echo RPC demo: `server <addr>` accepts websocket upgrades and
//! publishes an `echo` handler; `client <addr> <value>` connects, `fgcall`s
//! it, and prints the reply.

use std::cell::RefCell;
use std::rc::Rc;

use webloop::rpc::Rpc;
use webloop::socket::Socket;
use webloop::value::{Callable, OrderedMap, Value};
use webloop::websocket::{WebSocketConfig, Websocket};
use webloop::{Loop, Server};
use webloop::http::UpgradeRequest;

fn main() {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next(), args.next()) {
        (Some("server"), Some(addr), _) => run_server(addr),
        (Some("client"), Some(addr), value) => run_client(addr, value.unwrap_or_else(|| "42".to_string())),
        _ => {
            eprintln!("usage: echo-rpc-demo server <addr>");
            eprintln!("       echo-rpc-demo client <addr> <value>");
            std::process::exit(2);
        }
    }
}

fn run_server(addr: String) {
    webloop::logging::init_from_debug_env();
    let loop_ = Rc::new(Loop::new());
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        let server = Server::bind(&addr).await.expect("bind");
        tracing::info!(%addr, "listening");
        let loop_for_accept = loop_.clone();
        server.spawn_accept_loop(move |socket| handle_accepted(socket, loop_for_accept.clone()));
        loop_.run().await;
    });
}

/// Parses the HTTP upgrade request line by line with a single persistent
/// raw-mode callback (not `Socket::set_line_mode`, for the same reason
/// `Websocket::connect` avoids it: a frame piggybacked on the final blank
/// line must be handed to the frame decoder within this same invocation).
fn handle_accepted(socket: Socket, loop_: Rc<Loop>) {
    let request = Rc::new(RefCell::new(UpgradeRequest::new()));
    let loop_for_cb = loop_.clone();
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
            Err(e) => {
                tracing::warn!(error = %e, "malformed upgrade request");
                socket_for_cb.close();
                return;
            }
        };
        if !done {
            continue;
        }

        let response = match request.borrow().upgrade_response() {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting non-upgrade request");
                socket_for_cb.close();
                return;
            }
        };
        let ws = Websocket::accept(socket_for_cb.clone(), loop_for_cb.clone(), WebSocketConfig::default(), buf);
        publish_echo(ws, &loop_for_cb);
        let reply_socket = socket_for_cb.clone();
        tokio::task::spawn_local(async move {
            let _ = reply_socket.send(&response).await;
        });
        return;
    }));
}

fn publish_echo(ws: Websocket, loop_: &Rc<Loop>) {
    let rpc = Rpc::new(ws, loop_);
    rpc.publish(
        "echo",
        Callable::Function(Rc::new(|args, _kwargs| Ok(args.into_iter().next().unwrap_or(Value::None)))),
    );
}

fn run_client(addr: String, value: String) {
    webloop::logging::init_from_debug_env();
    let loop_ = Rc::new(Loop::new());
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        let ws = Websocket::connect(&addr, loop_.clone(), WebSocketConfig::default())
            .await
            .expect("handshake");
        let rpc = Rpc::new(ws, &loop_);
        let arg = value.parse::<i64>().map(Value::Int).unwrap_or_else(|_| Value::str(value.clone()));
        match rpc.fgcall("echo", vec![arg], OrderedMap::new()).await {
            Ok(reply) => println!("echo replied: {reply:?}"),
            Err(err) => eprintln!("echo call failed: {err:?}"),
        }
    });
}
