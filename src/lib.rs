//! A single-threaded, poll-based event loop; an RFC 6455 WebSocket client
//! and server-upgrade implementation; and a symmetric JSON-framed RPC
//! protocol whose handlers are coroutines.

pub mod address;
pub mod coroutine;
pub mod event_loop;
pub mod http;
pub mod logging;
pub mod rpc;
pub mod server;
pub mod socket;
pub mod value;
pub mod websocket;

pub use address::Address;
pub use coroutine::Coroutine;
pub use event_loop::Loop;
pub use rpc::Rpc;
pub use server::Server;
pub use socket::Socket;
pub use value::{Callable, OrderedMap, Value};
pub use websocket::{WebSocketConfig, Websocket, WsMessage};
