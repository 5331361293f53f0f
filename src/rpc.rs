//! Symmetric JSON-framed call/return/error protocol over a [`Websocket`],
//! with inbound dispatch to coroutine handlers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::coroutine::Coroutine;
use crate::event_loop::Loop;
use crate::value::{Callable, OrderedMap, Value};
use crate::websocket::{WsMessage, Websocket};

/// A one-shot reply callback for a `bgcall`.
pub type BgReply = Box<dyn FnOnce(Result<Value, Value>)>;

/// Handles a `call` frame whose target matched no published handler:
/// `(target, args, kwargs) -> Coroutine`.
pub type FallbackHandler = Rc<dyn Fn(&str, Vec<Value>, OrderedMap) -> Coroutine>;

struct Shared {
    reply_index: i64,
    expecting_bg: HashMap<i64, BgReply>,
    expecting_fg: HashMap<i64, oneshot::Sender<Result<Value, Value>>>,
    delayed_calls: Vec<(Option<i64>, String, Vec<Value>, OrderedMap)>,
    handlers: HashMap<String, Callable>,
    fallback: Option<FallbackHandler>,
    on_error: Option<Box<dyn FnMut(String)>>,
    activated: bool,
}

/// One peer's RPC state over a websocket. Cloning shares the connection.
#[derive(Clone)]
pub struct Rpc {
    inner: Rc<RefCell<Shared>>,
    ws: Websocket,
}

impl Rpc {
    /// Wraps `ws`. Registers a one-shot idle callback on `loop_` that drains
    /// any `call` frames received before this returns to the caller — the
    /// caller is expected to finish publishing handlers before the loop next
    /// goes idle.
    pub fn new(ws: Websocket, loop_: &Loop) -> Rpc {
        let shared = Rc::new(RefCell::new(Shared {
            reply_index: 0,
            expecting_bg: HashMap::new(),
            expecting_fg: HashMap::new(),
            delayed_calls: Vec::new(),
            handlers: HashMap::new(),
            fallback: None,
            on_error: None,
            activated: false,
        }));
        let rpc = Rpc { inner: shared, ws };

        let on_message = rpc.clone();
        rpc.ws.on_message(move |msg| on_message.on_message(msg));

        let on_disconnect = rpc.clone();
        rpc.ws.on_disconnect(move || on_disconnect.handle_disconnect());

        let activate = rpc.clone();
        loop_.register_idle(Box::new(move || {
            activate.activate();
            false
        }));

        rpc
    }

    pub fn publish(&self, name: impl Into<String>, handler: Callable) {
        self.inner.borrow_mut().handlers.insert(name.into(), handler);
    }

    pub fn set_fallback(&self, handler: FallbackHandler) {
        self.inner.borrow_mut().fallback = Some(handler);
    }

    /// Sets the handler for an `"error"` frame with no `id` — a general
    /// peer-delivered error not tied to any outstanding call.
    pub fn on_error(&self, cb: impl FnMut(String) + 'static) {
        self.inner.borrow_mut().on_error = Some(Box::new(cb));
    }

    /// Sends a call with no suspension. `reply` is invoked when the matching
    /// `return`/`error` arrives; `None` sends an event call (`id == null`)
    /// that expects no reply at all.
    pub fn bgcall(&self, target: &str, args: Vec<Value>, kwargs: OrderedMap, reply: Option<BgReply>) {
        let id = reply.as_ref().map(|_| self.allocate_id());
        if let (Some(id), Some(cb)) = (id, reply) {
            self.inner.borrow_mut().expecting_bg.insert(id, cb);
        }
        self.send_frame(encode_call(id, target, args, kwargs));
    }

    /// Sends a call and suspends until the matching `return`/`error` arrives,
    /// or the connection drops.
    pub async fn fgcall(&self, target: &str, args: Vec<Value>, kwargs: OrderedMap) -> Result<Value, Value> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.inner.borrow_mut().expecting_fg.insert(id, tx);
        self.send_frame(encode_call(Some(id), target, args, kwargs));
        rx.await.unwrap_or_else(|_| Err(Value::str("network connection closed")))
    }

    /// `reply_index` allocator: increments, skipping zero (reserved for
    /// event calls) and any id currently outstanding in either map.
    fn allocate_id(&self) -> i64 {
        let mut inner = self.inner.borrow_mut();
        loop {
            inner.reply_index = inner.reply_index.wrapping_add(1);
            if inner.reply_index == 0 {
                continue;
            }
            if inner.expecting_bg.contains_key(&inner.reply_index)
                || inner.expecting_fg.contains_key(&inner.reply_index)
            {
                continue;
            }
            return inner.reply_index;
        }
    }

    fn activate(&self) {
        let delayed = {
            let mut inner = self.inner.borrow_mut();
            inner.activated = true;
            std::mem::take(&mut inner.delayed_calls)
        };
        for (id, target, args, kwargs) in delayed {
            self.dispatch_call(id, target, args, kwargs);
        }
    }

    fn on_message(&self, msg: WsMessage) {
        let text = match msg {
            WsMessage::Text(t) => t,
            WsMessage::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
        };
        self.handle_frame(Value::load(&text));
    }

    fn handle_frame(&self, frame: Value) {
        let Some(parts) = frame.as_vector() else {
            warn!("malformed rpc frame: expected a two-element array");
            return;
        };
        if parts.len() != 2 {
            warn!(len = parts.len(), "malformed rpc frame: expected [tag, payload]");
            return;
        }
        let Some(tag) = parts[0].as_str() else {
            warn!("malformed rpc frame: tag is not a string");
            return;
        };
        match tag {
            "call" => self.handle_call(&parts[1]),
            "return" => self.handle_return(&parts[1]),
            "error" => self.handle_error(&parts[1]),
            other => warn!(tag = other, "unknown rpc frame tag"),
        }
    }

    fn handle_call(&self, payload: &Value) {
        let Some(items) = payload.as_vector() else {
            warn!("malformed call frame: payload is not an array");
            return;
        };
        if items.len() != 4 {
            warn!(len = items.len(), "malformed call frame: expected [id, target, args, kwargs]");
            return;
        }
        let id = match &items[0] {
            Value::Int(i) => Some(*i),
            Value::None => None,
            _ => {
                warn!("malformed call frame: id is neither int nor null");
                return;
            }
        };
        let Some(target) = items[1].as_str().map(str::to_string) else {
            warn!("malformed call frame: target is not a string");
            return;
        };
        let args = items[2].as_vector().map(<[Value]>::to_vec).unwrap_or_default();
        let kwargs = items[3].as_map().cloned().unwrap_or_default();

        if self.inner.borrow().activated {
            self.dispatch_call(id, target, args, kwargs);
        } else {
            self.inner.borrow_mut().delayed_calls.push((id, target, args, kwargs));
        }
    }

    /// Instantiates and runs the target's handler coroutine, sending the
    /// `return`/`error` frame once it completes. A call with `id == None`
    /// runs as an event: its outcome is never sent back.
    fn dispatch_call(&self, id: Option<i64>, target: String, args: Vec<Value>, kwargs: OrderedMap) {
        let handler = self.inner.borrow().handlers.get(&target).cloned();
        let coroutine = match handler {
            Some(callable) => callable.call(args, kwargs),
            None => {
                let fallback = self.inner.borrow().fallback.clone();
                match fallback {
                    Some(f) => f(&target, args, kwargs),
                    None => {
                        self.send_error(id, &format!("no such target: {target}"));
                        return;
                    }
                }
            }
        };
        let rpc = self.clone();
        tokio::task::spawn_local(async move {
            let result = coroutine.activate().await;
            let Some(id) = id else { return };
            match result {
                Ok(value) => rpc.send_frame(encode_return(id, value)),
                Err(err) => rpc.send_error(Some(id), &value_to_message(&err)),
            }
        });
    }

    fn handle_return(&self, payload: &Value) {
        let Some(items) = payload.as_vector() else { return };
        if items.len() != 2 {
            warn!(len = items.len(), "malformed return frame: expected [id, value]");
            return;
        }
        let Some(id) = items[0].as_int() else {
            warn!("malformed return frame: id is not an int");
            return;
        };
        self.resolve(id, Ok(items[1].clone()));
    }

    fn handle_error(&self, payload: &Value) {
        let Some(items) = payload.as_vector() else { return };
        if items.len() != 2 {
            warn!(len = items.len(), "malformed error frame: expected [id, message]");
            return;
        }
        let message = items[1].as_str().unwrap_or("remote error").to_string();
        match &items[0] {
            Value::Int(id) => self.resolve(*id, Err(Value::str(message))),
            Value::None => {
                let mut inner = self.inner.borrow_mut();
                if let Some(cb) = inner.on_error.as_mut() {
                    cb(message);
                } else {
                    drop(inner);
                    warn!(message, "unmatched rpc error frame");
                }
            }
            _ => warn!("malformed error frame: id is neither int nor null"),
        }
    }

    fn resolve(&self, id: i64, result: Result<Value, Value>) {
        let fg = self.inner.borrow_mut().expecting_fg.remove(&id);
        if let Some(tx) = fg {
            let _ = tx.send(result);
            return;
        }
        let bg = self.inner.borrow_mut().expecting_bg.remove(&id);
        match bg {
            Some(cb) => cb(result),
            None => warn!(id, "reply for unknown rpc id"),
        }
    }

    /// Transport error or EOF: fails every suspended `fgcall` with a
    /// terminal error; pending `bgcall` replies are dropped without being
    /// invoked, matching the deliberate "no post-disconnect bg delivery"
    /// behavior.
    fn handle_disconnect(&self) {
        self.log_pending();
        let fgs: Vec<_> = {
            let mut inner = self.inner.borrow_mut();
            inner.expecting_bg.clear();
            std::mem::take(&mut inner.expecting_fg).into_values().collect()
        };
        for tx in fgs {
            let _ = tx.send(Err(Value::str("network connection closed")));
        }
    }

    /// Dumps the ids still outstanding when the connection drops: every
    /// `expecting_fg` entry is about to be failed, every `expecting_bg` one
    /// silently dropped.
    fn log_pending(&self) {
        let inner = self.inner.borrow();
        if inner.expecting_fg.is_empty() && inner.expecting_bg.is_empty() {
            return;
        }
        let fg: Vec<i64> = inner.expecting_fg.keys().copied().collect();
        let bg: Vec<i64> = inner.expecting_bg.keys().copied().collect();
        debug!(?fg, ?bg, "disconnecting with calls still outstanding");
    }

    fn send_error(&self, id: Option<i64>, message: &str) {
        let id_value = id.map(Value::Int).unwrap_or(Value::None);
        self.send_frame(Value::Vector(vec![
            Value::str("error"),
            Value::Vector(vec![id_value, Value::str(message)]),
        ]));
    }

    fn send_frame(&self, frame: Value) {
        let text = match frame.dump() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to encode rpc frame");
                return;
            }
        };
        let ws = self.ws.clone();
        tokio::task::spawn_local(async move {
            let _ = ws.send_text(&text).await;
        });
    }
}

fn encode_call(id: Option<i64>, target: &str, args: Vec<Value>, kwargs: OrderedMap) -> Value {
    let id_value = id.map(Value::Int).unwrap_or(Value::None);
    Value::Vector(vec![
        Value::str("call"),
        Value::Vector(vec![id_value, Value::str(target), Value::Vector(args), Value::Map(kwargs)]),
    ])
}

fn encode_return(id: i64, value: Value) -> Value {
    Value::Vector(vec![Value::str("return"), Value::Vector(vec![Value::Int(id), value])])
}

fn value_to_message(v: &Value) -> String {
    v.as_str().map(str::to_string).unwrap_or_else(|| v.dump().unwrap_or_else(|_| "remote call failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_value(v: &Value) -> Option<i64> {
        v.as_vector().and_then(|p| p.get(1)).and_then(|p| p.as_vector()).and_then(|i| i[0].as_int())
    }

    #[test]
    fn encode_call_uses_null_id_for_event_calls() {
        let frame = encode_call(None, "log", vec![Value::str("hi")], OrderedMap::new());
        assert_eq!(id_value(&frame), None);
        let parts = frame.as_vector().unwrap();
        assert_eq!(parts[0].as_str(), Some("call"));
    }

    #[test]
    fn encode_return_carries_the_value_alongside_its_id() {
        let frame = encode_return(5, Value::Int(42));
        let parts = frame.as_vector().unwrap();
        assert_eq!(parts[0].as_str(), Some("return"));
        let payload = parts[1].as_vector().unwrap();
        assert_eq!(payload[0].as_int(), Some(5));
        assert_eq!(payload[1].as_int(), Some(42));
    }

    #[test]
    fn value_to_message_prefers_string_payload() {
        assert_eq!(value_to_message(&Value::str("boom")), "boom");
        assert_eq!(value_to_message(&Value::Int(7)), "7");
    }
}
