//! A handler that itself issues a nested `fgcall` back to its caller: A's
//! `outer` calls B's `inner` and folds the result into its own return value.

use std::rc::Rc;

use webloop::Loop;
use webloop::coroutine::Coroutine;
use webloop::rpc::Rpc;
use webloop::value::{Callable, OrderedMap, Value};
use webloop::websocket::{WebSocketConfig, Websocket};

#[path = "support.rs"]
mod support;

#[tokio::test]
async fn nested_fgcall_resolves_through_both_peers() {
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
            let nested_via = server_rpc.clone();
            server_rpc.publish(
                "outer",
                Callable::CoroutineFunction(Rc::new(move |_args, _kwargs| {
                    let rpc = nested_via.clone();
                    Coroutine::new(async move {
                        let inner = rpc.fgcall("inner", vec![], OrderedMap::new()).await?;
                        let n = inner.as_int().unwrap_or(0);
                        Ok(Value::Int(n * 2))
                    })
                })),
            );

            let client_rpc = Rpc::new(client_ws, &client_loop);
            client_rpc.publish(
                "inner",
                Callable::Function(Rc::new(|_args, _kwargs| Ok(Value::Int(7)))),
            );

            let server_loop_bg = server_loop.clone();
            tokio::task::spawn_local(async move { server_loop_bg.run().await });
            let client_loop_bg = client_loop.clone();
            tokio::task::spawn_local(async move { client_loop_bg.run().await });

            let reply = client_rpc
                .fgcall("outer", vec![], OrderedMap::new())
                .await
                .expect("outer call succeeds");
            assert_eq!(reply, Value::Int(14));

            server_loop.stop(false);
            client_loop.stop(false);
        })
        .await;
}
