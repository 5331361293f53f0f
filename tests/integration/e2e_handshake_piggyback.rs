//! A frame piggybacked in the same TCP segment as the upgrade request's
//! trailing blank line must be delivered without waiting on a second read —
//! there may never be one.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use webloop::Loop;
use webloop::websocket::WsMessage;
use webloop::websocket::frame::{OP_TEXT, encode_frame};
use webloop::websocket::handshake::build_request;

#[path = "support.rs"]
mod support;

#[tokio::test]
async fn piggybacked_frame_is_delivered_without_a_second_read() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let server_loop = Rc::new(Loop::new());
            let (server, mut accepted) = support::spawn_ws_server(server_loop.clone()).await;
            let addr = support::server_addr(&server);

            let mut request = build_request(&addr, "/", None, &[]);
            let frame = encode_frame(OP_TEXT, b"piggybacked", Some([1, 2, 3, 4]));
            request.extend_from_slice(&frame);

            let mut raw = TcpStream::connect(&addr).await.expect("raw tcp connect");
            raw.write_all(&request).await.expect("single write carrying both handshake and frame");

            let server_ws = accepted.recv().await.expect("server accepted a connection");
            let received = Rc::new(RefCell::new(None));
            let received_cb = received.clone();
            server_ws.on_message(move |msg| {
                *received_cb.borrow_mut() = Some(msg);
            });

            let server_loop_bg = server_loop.clone();
            tokio::task::spawn_local(async move { server_loop_bg.run().await });

            // No further bytes are ever sent; delivery must happen as part of
            // handling the handshake itself, not a later read.
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert_eq!(received.borrow().clone(), Some(WsMessage::Text("piggybacked".to_string())));

            server_loop.stop(false);
            drop(raw);
        })
        .await;
}
