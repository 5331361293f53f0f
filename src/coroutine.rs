//! Coroutine machinery: resumable computations that ultimately produce a
//! [`Value`] or an error `Value`, with delegation and external-resume
//! primitives layered on top of plain `async fn`s.
//!
//! Rust's `async fn` already compiles to a resumable state machine, so
//! `Coroutine` here is a thin handle around a boxed future; `yield_from` and
//! `get_handle` are named combinators over it rather than new machinery.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::oneshot;

use crate::value::Value;

type LocalBoxFuture = Pin<Box<dyn Future<Output = Result<Value, Value>>>>;

/// A resumable computation that ultimately produces `Ok(value)` or `Err(value)`.
///
/// Running it to completion — `.await`ing it, or handing it to the loop's
/// local task set — is activation; there is no separate step-by-step resume
/// call the way the C++ original needs one.
pub struct Coroutine {
    fut: LocalBoxFuture,
}

impl Coroutine {
    pub fn new(fut: impl Future<Output = Result<Value, Value>> + 'static) -> Self {
        Coroutine { fut: Box::pin(fut) }
    }

    /// Wraps an already-available result as a coroutine that completes
    /// immediately — what calling a non-coroutine [`Callable`](crate::value::Callable)
    /// variant produces.
    pub fn completed(result: Result<Value, Value>) -> Self {
        Coroutine::new(async move { result })
    }

    /// Runs the coroutine to completion.
    pub async fn activate(self) -> Result<Value, Value> {
        self.fut.await
    }
}

/// Lets a coroutine obtain something external code can use to resume it
/// later, e.g. from an I/O completion callback. Modeled as a oneshot sender
/// the coroutine can stash and the holder can fire once.
pub struct ResumeHandle {
    tx: oneshot::Sender<Value>,
}

impl ResumeHandle {
    pub fn resume(self, value: Value) {
        let _ = self.tx.send(value);
    }
}

/// Suspends the current async fn until [`ResumeHandle::resume`] is called
/// elsewhere, returning the handle alongside the eventual resume value so
/// callers can do `let (handle, wait) = get_handle(); hand_handle_to_io(handle); wait.await`.
pub fn get_handle() -> (ResumeHandle, oneshot::Receiver<Value>) {
    let (tx, rx) = oneshot::channel();
    (ResumeHandle { tx }, rx)
}

/// Suspends the current coroutine until `other` completes, routing its
/// outcome back as this coroutine's own. In terms of plain futures this is
/// just awaiting the delegate; kept as a named function so call sites read
/// the same way a direct sub-call would in the original.
pub async fn yield_from(other: Coroutine) -> Result<Value, Value> {
    other.activate().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_coroutine_activates_to_its_value() {
        let co = Coroutine::completed(Ok(Value::Int(42)));
        assert_eq!(co.activate().await, Ok(Value::Int(42)));
    }

    #[tokio::test]
    async fn completed_coroutine_activates_to_its_error() {
        let co = Coroutine::completed(Err(Value::str("boom")));
        assert_eq!(co.activate().await, Err(Value::str("boom")));
    }

    #[tokio::test]
    async fn yield_from_forwards_delegate_return_value() {
        let inner = Coroutine::new(async { Ok(Value::Int(7)) });
        assert_eq!(yield_from(inner).await, Ok(Value::Int(7)));
    }

    #[tokio::test]
    async fn get_handle_suspends_until_externally_resumed() {
        let (handle, wait) = get_handle();
        handle.resume(Value::Bool(true));
        assert_eq!(wait.await.unwrap(), Value::Bool(true));
    }
}
