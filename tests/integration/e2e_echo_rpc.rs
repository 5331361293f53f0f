//! A plain foreground call resolves with the handler's return value.

use std::rc::Rc;

use webloop::Loop;
use webloop::rpc::Rpc;
use webloop::value::{Callable, OrderedMap, Value};
use webloop::websocket::{WebSocketConfig, Websocket};

#[path = "support.rs"]
mod support;

#[tokio::test]
async fn fgcall_echo_returns_the_argument_unchanged() {
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

            let server_rpc = Rpc::new(server_ws, &server_loop);
            server_rpc.publish(
                "echo",
                Callable::Function(Rc::new(|args, _kwargs| Ok(args.into_iter().next().unwrap_or(Value::None)))),
            );
            let client_rpc = Rpc::new(client_ws, &client_loop);

            let server_loop_bg = server_loop.clone();
            tokio::task::spawn_local(async move { server_loop_bg.run().await });
            let client_loop_bg = client_loop.clone();
            tokio::task::spawn_local(async move { client_loop_bg.run().await });

            let reply = client_rpc
                .fgcall("echo", vec![Value::str("hello")], OrderedMap::new())
                .await
                .expect("echo call succeeds");
            assert_eq!(reply, Value::str("hello"));

            server_loop.stop(false);
            client_loop.stop(false);
        })
        .await;
}
