//! A connection dropped while a `fgcall` is suspended resolves it with an
//! error rather than leaving it pending forever, and leaves no trace behind
//! in the RPC layer's bookkeeping.

use std::cell::RefCell;
use std::rc::Rc;

use tokio::sync::oneshot;

use webloop::Loop;
use webloop::coroutine::Coroutine;
use webloop::rpc::Rpc;
use webloop::value::{Callable, OrderedMap, Value};
use webloop::websocket::{WebSocketConfig, Websocket};

#[path = "support.rs"]
mod support;

#[tokio::test]
async fn fgcall_resolves_with_error_when_peer_disconnects_mid_call() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let server_loop = Rc::new(Loop::new());
            let client_loop = Rc::new(Loop::new());

            let (server, mut accepted) = support::spawn_ws_server(server_loop.clone()).await;
            let addr = support::server_addr(&server);

            let client_ws = Websocket::connect(&addr, client_loop.clone(), WebSocketConfig::default())
                .await
                .expect("client handshake");
            let server_ws = accepted.recv().await.expect("server accepted a connection");
            let server_ws_to_close = server_ws.clone();

            let (entered_tx, entered_rx) = oneshot::channel::<()>();
            let entered_tx = Rc::new(RefCell::new(Some(entered_tx)));

            let server_rpc = Rpc::new(server_ws, &server_loop);
            server_rpc.publish(
                "block",
                Callable::CoroutineFunction(Rc::new(move |_args, _kwargs| {
                    if let Some(tx) = entered_tx.borrow_mut().take() {
                        let _ = tx.send(());
                    }
                    Coroutine::new(std::future::pending())
                })),
            );
            let client_rpc = Rpc::new(client_ws, &client_loop);

            let server_loop_bg = server_loop.clone();
            tokio::task::spawn_local(async move { server_loop_bg.run().await });
            let client_loop_bg = client_loop.clone();
            tokio::task::spawn_local(async move { client_loop_bg.run().await });

            tokio::task::spawn_local(async move {
                let _ = entered_rx.await;
                server_ws_to_close.close();
            });

            let result: Result<Value, Value> =
                client_rpc.fgcall("block", vec![], OrderedMap::new()).await;
            assert_eq!(result, Err(Value::str("network connection closed")));

            server_loop.stop(false);
            client_loop.stop(false);
        })
        .await;
}
