//! Free-list pools for the per-frame objects.
//!
//! Each pool is a mutex-guarded stack of idle instances. `acquire` pops one
//! or allocates; `release` resets the instance before pushing it back, so no
//! caller can observe another holder's data. Release takes the value by
//! ownership, which rules out releasing the same object twice.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use spop_frame::{Kv, Message};

use crate::request::Request;

/// Objects that can be wiped for reuse.
pub trait Recycle: Default + Send {
    /// Return to the freshly-constructed state, keeping allocations.
    fn reset(&mut self);
}

impl Recycle for Kv {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Recycle for Message {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Recycle for Request {
    fn reset(&mut self) {
        self.engine_id.clear();
        self.stream_id = 0;
        self.frame_id = 0;
        self.messages.clear();
        self.actions.clear();
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances waiting in the free list.
    pub idle: usize,
    /// Instances allocated because the free list was empty.
    pub created: usize,
}

/// Unbounded, thread-safe free list.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    created: AtomicUsize,
}

impl<T: Recycle> Pool<T> {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Take an idle instance, or allocate one.
    pub fn acquire(&self) -> T {
        if let Some(item) = self.idle.lock().pop() {
            return item;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        T::default()
    }

    /// Reset `item` and make it available again.
    pub fn release(&self, mut item: T) {
        item.reset();
        self.idle.lock().push(item);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            created: self.created.load(Ordering::Relaxed),
        }
    }
}

impl<T: Recycle> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for all three pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolsStats {
    pub kv: PoolStats,
    pub messages: PoolStats,
    pub requests: PoolStats,
}

/// The KV, Message and Request pools shared by every connection of an agent.
///
/// Nested objects are released to their own pool first: a released request
/// hands its messages back, and a released message hands its KV container
/// back.
#[derive(Default)]
pub struct Pools {
    kv: Pool<Kv>,
    messages: Pool<Message>,
    requests: Pool<Request>,
}

impl Pools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_kv(&self) -> Kv {
        self.kv.acquire()
    }

    pub fn release_kv(&self, kv: Kv) {
        self.kv.release(kv);
    }

    /// A message whose argument container also came from the KV pool.
    pub fn acquire_message(&self) -> Message {
        let mut message = self.messages.acquire();
        message.args = self.kv.acquire();
        message
    }

    pub fn release_message(&self, mut message: Message) {
        self.kv.release(std::mem::take(&mut message.args));
        self.messages.release(message);
    }

    pub fn acquire_request(&self) -> Request {
        self.requests.acquire()
    }

    pub fn release_request(&self, mut request: Request) {
        for message in request.messages.drain(..) {
            self.release_message(message);
        }
        self.requests.release(request);
    }

    pub fn stats(&self) -> PoolsStats {
        PoolsStats {
            kv: self.kv.stats(),
            messages: self.messages.stats(),
            requests: self.requests.stats(),
        }
    }
}
