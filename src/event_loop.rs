//! The cooperative event loop: IO, timer, and idle registries with stable
//! handles, driven internally by a single-threaded `tokio` runtime plus a
//! `LocalSet` so nothing here is ever touched from another OS thread.
//!
//! The packed-array-plus-free-list registry shape mirrors a classic poll-loop
//! fd table; the poll syscall itself is replaced by `tokio::io::unix::AsyncFd`
//! readiness, which is this runtime's equivalent reactor primitive.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio::time::Instant;
use tracing::warn;

const FLOOR: usize = 8;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("handle not found")]
    NotFound,
    #[error("io registration failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A stable reference into one of the loop's registries. Two handles handed
/// out for different live registrations never compare equal, even after the
/// underlying storage slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

enum Slot<T> {
    Occupied(u64, T),
    Vacant(u64),
}

/// Packed array with a free-index set, matching the original's IO table
/// layout. `insert` grows capacity ×8 when full; `remove` shrinks capacity
/// ×⅛ when occupancy drops below ⅛ of capacity, as long as no occupied slot
/// lies beyond the new capacity and the floor hasn't been reached.
struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Registry { slots: Vec::new(), free: Vec::new(), len: 0 }
    }

    fn grow(&mut self) {
        let old_cap = self.slots.len();
        let new_cap = if old_cap == 0 { FLOOR } else { old_cap * 8 };
        for i in old_cap..new_cap {
            self.slots.push(Slot::Vacant(0));
            self.free.push(i);
        }
    }

    fn shrink_if_sparse(&mut self) {
        let cap = self.slots.len();
        if cap <= FLOOR || self.len * 8 > cap {
            return;
        }
        let new_cap = (cap / 8).max(FLOOR);
        let highest_occupied = self
            .slots
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| matches!(s, Slot::Occupied(..)))
            .map(|(i, _)| i);
        if let Some(hi) = highest_occupied {
            if hi >= new_cap {
                return;
            }
        }
        self.slots.truncate(new_cap);
        self.free.retain(|&i| i < new_cap);
    }

    fn insert(&mut self, value: T) -> Handle {
        if self.free.is_empty() {
            self.grow();
        }
        let index = self.free.pop().expect("grow() refilled the free list");
        let generation = match self.slots[index] {
            Slot::Vacant(g) => g,
            Slot::Occupied(..) => unreachable!("free index must be vacant"),
        };
        self.slots[index] = Slot::Occupied(generation, value);
        self.len += 1;
        Handle { index, generation }
    }

    fn get(&self, h: Handle) -> Option<&T> {
        match self.slots.get(h.index)? {
            Slot::Occupied(g, v) if *g == h.generation => Some(v),
            _ => None,
        }
    }

    fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
        match self.slots.get_mut(h.index)? {
            Slot::Occupied(g, v) if *g == h.generation => Some(v),
            _ => None,
        }
    }

    fn remove(&mut self, h: Handle) -> Option<T> {
        let slot = self.slots.get_mut(h.index)?;
        match slot {
            Slot::Occupied(g, _) if *g == h.generation => {
                let next_gen = g.wrapping_add(1);
                let Slot::Occupied(_, v) = std::mem::replace(slot, Slot::Vacant(next_gen)) else {
                    unreachable!()
                };
                self.free.push(h.index);
                self.len -= 1;
                self.shrink_if_sparse();
                Some(v)
            }
            _ => None,
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied(generation, v) => Some((Handle { index, generation: *generation }, v)),
            Slot::Vacant(_) => None,
        })
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub type IdleCallback = Box<dyn FnMut() -> bool>;
pub type TimerCallback = Box<dyn FnMut() -> bool>;

struct TimeoutRecord {
    deadline: Instant,
    interval: Duration,
    callback: TimerCallback,
}

struct IdleRecord {
    callback: IdleCallback,
}

/// An interest set for a raw-fd registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
}

enum IoEvent {
    Ready { handle: Handle, readable: bool, writable: bool },
    Error { handle: Handle },
    /// Carries no readiness of its own; its only job is to unpark a
    /// `run_one_iteration` that's already parked in `rx.recv()` with no
    /// timeout so it re-evaluates `have_idle`/`next_timer_deadline` against
    /// a registration that just arrived.
    Wake,
}

struct IoEntry {
    // kept only so a still-registered fd isn't silently treated as already
    // removed by the watcher task sending a stale event.
    _fd: RawFd,
}

struct Inner {
    timers: Registry<TimeoutRecord>,
    idles: Registry<IdleRecord>,
    ios: Registry<IoEntry>,
    io_callbacks: std::collections::HashMap<Handle, Box<dyn FnMut(bool, bool) -> bool>>,
    running: bool,
    stop_force: bool,
}

/// The single-threaded reactor. Owns its own `tokio` current-thread runtime
/// internally; construct one per OS thread (or use [`Loop::default_loop`]).
pub struct Loop {
    inner: Rc<RefCell<Inner>>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    io_rx: RefCell<mpsc::UnboundedReceiver<IoEvent>>,
}

impl Loop {
    pub fn new() -> Self {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        Loop {
            inner: Rc::new(RefCell::new(Inner {
                timers: Registry::new(),
                idles: Registry::new(),
                ios: Registry::new(),
                io_callbacks: std::collections::HashMap::new(),
                running: false,
                stop_force: false,
            })),
            io_tx,
            io_rx: RefCell::new(io_rx),
        }
    }

    /// Returns this thread's lazily-created default loop. Kept for parity
    /// with the original's `Loop::get()` singleton accessor; library
    /// internals never rely on it themselves, they always take an explicit
    /// `&Loop`.
    pub fn default_loop() -> Rc<Loop> {
        DEFAULT_LOOP.with(|slot| slot.borrow_mut().get_or_insert_with(|| Rc::new(Loop::new())).clone())
    }

    /// Registers a raw fd for readiness notification. The returned handle
    /// stays valid until [`Loop::remove_io`] is called, even across other
    /// registrations being added or removed mid-callback. Must be called
    /// from inside the loop's own `LocalSet` (i.e. from a callback, or from
    /// a task spawned onto it) — `Socket`/`Server` don't use this path
    /// themselves, they read and write through `tokio::net` directly.
    pub fn register_io<F>(
        &self,
        fd: RawFd,
        interest: Interest,
        mut on_ready: F,
    ) -> Result<Handle, LoopError>
    where
        F: FnMut(bool, bool) -> bool + 'static,
    {
        let handle = self.inner.borrow_mut().ios.insert(IoEntry { _fd: fd });
        let async_fd = AsyncFd::new(BorrowedRawFd(fd))?;
        let tx = self.io_tx.clone();
        tokio::task::spawn_local(async move {
            loop {
                enum Woke {
                    Readable(std::io::Result<()>),
                    Writable(std::io::Result<()>),
                }
                let readable_fut = async {
                    if interest.readable {
                        Woke::Readable(async_fd.readable().await.map(|mut g| g.clear_ready()))
                    } else {
                        std::future::pending().await
                    }
                };
                let writable_fut = async {
                    if interest.writable {
                        Woke::Writable(async_fd.writable().await.map(|mut g| g.clear_ready()))
                    } else {
                        std::future::pending().await
                    }
                };
                let woke = tokio::select! {
                    w = readable_fut => w,
                    w = writable_fut => w,
                };
                let event = match woke {
                    Woke::Readable(Ok(())) => IoEvent::Ready { handle, readable: true, writable: false },
                    Woke::Writable(Ok(())) => IoEvent::Ready { handle, readable: false, writable: true },
                    Woke::Readable(Err(_)) | Woke::Writable(Err(_)) => IoEvent::Error { handle },
                };
                let is_error = matches!(event, IoEvent::Error { .. });
                if tx.send(event).is_err() || is_error {
                    return;
                }
            }
        });
        // The callback itself is invoked from the central run loop, not the
        // watcher task, so callback invocation stays serialized per fd.
        self.inner.borrow_mut().io_callbacks.insert(handle, Box::new(on_ready));
        Ok(handle)
    }

    pub fn remove_io(&self, handle: Handle) -> bool {
        let mut inner = self.inner.borrow_mut();
        let removed = inner.ios.remove(handle).is_some();
        inner.io_callbacks.remove(&handle);
        removed
    }

    /// Registers a one-shot (`interval == Duration::ZERO`) or repeating timer.
    pub fn register_timeout(
        &self,
        deadline: Instant,
        interval: Duration,
        callback: TimerCallback,
    ) -> Handle {
        let handle = self.inner.borrow_mut().timers.insert(TimeoutRecord { deadline, interval, callback });
        let _ = self.io_tx.send(IoEvent::Wake);
        handle
    }

    pub fn remove_timeout(&self, handle: Handle) -> bool {
        self.inner.borrow_mut().timers.remove(handle).is_some()
    }

    /// Registering an idle callback while a running loop is already parked
    /// in `run_one_iteration`'s indefinite wait (no prior idle or timer to
    /// bound it) would otherwise never be noticed — nothing else wakes that
    /// wait. The `Wake` nudge makes it safe to register idles and timers at
    /// any point after the loop has started, not just before.
    pub fn register_idle(&self, callback: IdleCallback) -> Handle {
        let handle = self.inner.borrow_mut().idles.insert(IdleRecord { callback });
        let _ = self.io_tx.send(IoEvent::Wake);
        handle
    }

    pub fn remove_idle(&self, handle: Handle) -> bool {
        self.inner.borrow_mut().idles.remove(handle).is_some()
    }

    /// Requests the loop stop after the current iteration (`force = false`)
    /// or immediately, skipping any remaining callbacks this iteration
    /// (`force = true`).
    pub fn stop(&self, force: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.running = false;
        if force {
            inner.stop_force = true;
        }
    }

    /// Runs the loop until [`Loop::stop`] is called. Must be called from
    /// within a `LocalSet` (see [`Loop::block_on`]).
    pub async fn run(&self) {
        self.inner.borrow_mut().running = true;
        self.inner.borrow_mut().stop_force = false;
        loop {
            if !self.inner.borrow().running {
                break;
            }
            self.run_one_iteration().await;
        }
    }

    /// Convenience wrapper: builds a current-thread runtime, a `LocalSet`,
    /// and runs `self.run()` to completion on them.
    pub fn block_on_run(&self) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build current-thread runtime");
        let local = LocalSet::new();
        local.block_on(&rt, self.run());
    }

    async fn run_one_iteration(&self) {
        let next_deadline = self.next_timer_deadline();
        let have_idle = !self.inner.borrow().idles.is_empty();
        let timeout = if have_idle { Some(Instant::now()) } else { next_deadline };

        let event = {
            let mut rx = self.io_rx.borrow_mut();
            match timeout {
                Some(deadline) => tokio::time::timeout_at(deadline, rx.recv()).await.ok().flatten(),
                None => rx.recv().await,
            }
        };

        if let Some(event) = event {
            self.dispatch_io_event(event);
            if self.inner.borrow().stop_force {
                return;
            }
        }

        self.fire_due_timers();
        if self.inner.borrow().stop_force {
            return;
        }

        if have_idle {
            self.fire_idle_once();
        }
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.borrow_mut();
        inner
            .timers
            .iter_mut()
            .map(|(_, t)| t.deadline)
            .min()
    }

    fn dispatch_io_event(&self, event: IoEvent) {
        let mut inner = self.inner.borrow_mut();
        match event {
            IoEvent::Ready { handle, readable, writable } => {
                if inner.ios.get(handle).is_none() {
                    return; // removed since the event was queued
                }
                let keep = if let Some(cb) = inner.io_callbacks.get_mut(&handle) {
                    cb(readable, writable)
                } else {
                    true
                };
                if !keep {
                    drop(inner);
                    self.remove_io(handle);
                }
            }
            IoEvent::Error { handle } => {
                drop(inner);
                warn!(?handle, "io registration errored, removing");
                self.remove_io(handle);
            }
            IoEvent::Wake => {}
        }
    }

    /// Fires every timer whose deadline has passed, applying catch-up:
    /// a repeating timer more than one interval overdue jumps forward by
    /// whole intervals rather than replaying missed fires.
    fn fire_due_timers(&self) {
        let now = Instant::now();
        let due: Vec<Handle> = {
            let mut inner = self.inner.borrow_mut();
            inner
                .timers
                .iter_mut()
                .filter(|(_, t)| t.deadline <= now)
                .map(|(h, _)| h)
                .collect()
        };
        for handle in due {
            if self.inner.borrow().stop_force {
                return;
            }
            let keep = {
                let mut inner = self.inner.borrow_mut();
                let Some(record) = inner.timers.get_mut(handle) else { continue };
                let keep = (record.callback)();
                if keep && record.interval > Duration::ZERO {
                    let mut deadline = record.deadline + record.interval;
                    while deadline <= now {
                        deadline += record.interval;
                    }
                    record.deadline = deadline;
                }
                keep
            };
            if !keep || {
                let inner = self.inner.borrow();
                inner.timers.get(handle).map(|r| r.interval == Duration::ZERO).unwrap_or(false)
            } {
                self.remove_timeout(handle);
            }
        }
    }

    fn fire_idle_once(&self) {
        let handles: Vec<Handle> = {
            let mut inner = self.inner.borrow_mut();
            inner.idles.iter_mut().map(|(h, _)| h).collect()
        };
        for handle in handles {
            if self.inner.borrow().stop_force {
                return;
            }
            let keep = {
                let mut inner = self.inner.borrow_mut();
                match inner.idles.get_mut(handle) {
                    Some(record) => (record.callback)(),
                    None => continue,
                }
            };
            if !keep {
                self.remove_idle(handle);
            }
        }
    }
}

impl Default for Loop {
    fn default() -> Self {
        Loop::new()
    }
}

thread_local! {
    static DEFAULT_LOOP: RefCell<Option<Rc<Loop>>> = const { RefCell::new(None) };
}

/// Wraps a bare fd so it can be handed to `AsyncFd` without taking ownership
/// away from the caller's own socket type, which still owns and closes it.
struct BorrowedRawFd(RawFd);

impl AsRawFd for BorrowedRawFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reuses_freed_slots_and_bumps_generation() {
        let mut reg: Registry<i32> = Registry::new();
        let a = reg.insert(1);
        reg.remove(a);
        let b = reg.insert(2);
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert_eq!(reg.get(a), None);
        assert_eq!(reg.get(b), Some(&2));
    }

    #[test]
    fn registry_grows_by_eight_when_full() {
        let mut reg: Registry<i32> = Registry::new();
        for i in 0..FLOOR {
            reg.insert(i as i32);
        }
        assert_eq!(reg.slots.len(), FLOOR);
        reg.insert(999);
        assert_eq!(reg.slots.len(), FLOOR * 8);
    }

    #[test]
    fn registry_shrinks_when_sparse() {
        let mut reg: Registry<i32> = Registry::new();
        let mut handles = Vec::new();
        for i in 0..FLOOR * 8 {
            handles.push(reg.insert(i as i32));
        }
        assert_eq!(reg.slots.len(), FLOOR * 8);
        for h in handles.drain(1..) {
            reg.remove(h);
        }
        assert!(reg.slots.len() < FLOOR * 8);
    }
}
