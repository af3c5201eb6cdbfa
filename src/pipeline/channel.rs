//! Bounded channel connecting two segments.
//!
//! A [`Channel`] is split into a [`Sink`] (write end, owned by the upstream
//! segment) and a [`Source`] (read end, owned by the downstream segment).
//! It is the only object shared between segment threads; everything else is
//! owned by exactly one thread.
//!
//! # Guarantees
//!
//! - FIFO order is preserved.
//! - The queue never holds more than `capacity` items. A capacity of 0 is a
//!   rendezvous channel: `push` returns once the consumer has taken the item.
//!   The single item in transit sits in the queue until then, so `len()` and
//!   `high_water` read 1 during a hand-off.
//! - `close` is idempotent. Pops drain what is queued before reporting
//!   end-of-stream (`None`).
//! - Pushing after `close` panics.
//! - Dropping the [`Sink`] closes the channel; dropping the [`Source`]
//!   disconnects it, after which pushes discard instead of blocking.

use crate::pipeline::id::ChannelId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default number of items a channel buffers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// What `push` does when the channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block the producer until space is available.
    #[default]
    Block,
    /// Reject the incoming item; it is never accepted, so never "lost".
    DropIncoming,
}

/// Snapshot of a channel's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChannelStats {
    pub capacity: usize,
    pub len: usize,
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    /// Largest queue length observed.
    pub high_water: usize,
    pub closed: bool,
}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    /// The `Source` was dropped.
    disconnected: bool,
    waiting_consumers: usize,
    pushed: u64,
    popped: u64,
    dropped: u64,
    high_water: usize,
}

struct Shared<T> {
    id: ChannelId,
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> ChannelStats {
        let state = self.lock();
        ChannelStats {
            capacity: self.capacity,
            len: state.queue.len(),
            pushed: state.pushed,
            popped: state.popped,
            dropped: state.dropped,
            high_water: state.high_water,
            closed: state.closed,
        }
    }
}

/// Type-erased occupancy view used by rate governors and reports.
trait Occupancy: Send + Sync {
    fn id(&self) -> ChannelId;
    fn name(&self) -> &str;
    fn capacity(&self) -> usize;
    fn len(&self) -> usize;
    fn stats(&self) -> ChannelStats;
}

impl<T: Send> Occupancy for Shared<T> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.lock().queue.len()
    }

    fn stats(&self) -> ChannelStats {
        Shared::stats(self)
    }
}

/// Builder for a Sink/Source pair.
///
/// ```rust,ignore
/// use stagepipe::pipeline::{Channel, OverflowPolicy};
///
/// let (sink, source) = Channel::<u32>::new(8).with_name("decoded").split();
/// ```
pub struct Channel<T> {
    id: ChannelId,
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send> Channel<T> {
    /// Create a channel buffering at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            id: ChannelId::default(),
            name: format!("channel-{}", capacity),
            capacity,
            policy: OverflowPolicy::Block,
            _marker: std::marker::PhantomData,
        }
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the diagnostic ID.
    pub fn with_id(mut self, id: ChannelId) -> Self {
        self.id = id;
        self
    }

    /// Set the overflow policy.
    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Split into the write and read ends.
    pub fn split(self) -> (Sink<T>, Source<T>) {
        let shared = Arc::new(Shared {
            id: self.id,
            name: self.name,
            capacity: self.capacity,
            policy: self.policy,
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(self.capacity.clamp(1, 1024)),
                closed: false,
                disconnected: false,
                waiting_consumers: 0,
                pushed: 0,
                popped: 0,
                dropped: 0,
                high_water: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        });
        (
            Sink {
                shared: Arc::clone(&shared),
            },
            Source { shared },
        )
    }
}

/// Create a blocking channel with the given capacity.
pub fn channel<T: Send>(capacity: usize) -> (Sink<T>, Source<T>) {
    Channel::new(capacity).split()
}

/// Write end of a channel.
pub struct Sink<T: Send> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Sink<T> {
    /// Push an item, blocking while the channel is full.
    ///
    /// Returns `false` if the item was not accepted: the reader is gone, or
    /// the channel is full under [`OverflowPolicy::DropIncoming`].
    ///
    /// # Panics
    ///
    /// Panics if the channel was already closed.
    pub fn push(&self, item: T) -> bool {
        let shared = &*self.shared;
        let mut state = shared.lock();
        if state.closed {
            drop(state);
            panic!("push on closed channel '{}' ({})", shared.name, shared.id);
        }

        if shared.capacity == 0 {
            return self.hand_off(state, item);
        }

        while state.queue.len() >= shared.capacity && !state.disconnected {
            match shared.policy {
                OverflowPolicy::Block => {
                    state = shared
                        .not_full
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                OverflowPolicy::DropIncoming => {
                    state.dropped += 1;
                    return false;
                }
            }
        }

        if state.disconnected {
            state.dropped += 1;
            return false;
        }

        state.queue.push_back(item);
        state.pushed += 1;
        state.high_water = state.high_water.max(state.queue.len());
        shared.not_empty.notify_one();
        true
    }

    /// Rendezvous push for zero-capacity channels.
    fn hand_off(&self, mut state: MutexGuard<'_, State<T>>, item: T) -> bool {
        let shared = &*self.shared;
        if state.disconnected
            || (shared.policy == OverflowPolicy::DropIncoming && state.waiting_consumers == 0)
        {
            state.dropped += 1;
            return false;
        }

        state.queue.push_back(item);
        state.pushed += 1;
        state.high_water = state.high_water.max(state.queue.len());
        let ticket = state.pushed;
        shared.not_empty.notify_one();

        while state.popped < ticket && !state.disconnected {
            state = shared
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        true
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.shared.not_empty.notify_all();
        tracing::debug!(
            "Channel '{}' closed after {} items",
            self.shared.name,
            state.pushed
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// True once the reading side has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.shared.lock().disconnected
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.stats()
    }

    /// Read-only occupancy handle usable from any thread.
    pub fn probe(&self) -> ChannelProbe {
        ChannelProbe {
            inner: self.shared.clone(),
        }
    }
}

impl<T: Send> Drop for Sink<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if !state.closed {
            state.closed = true;
            self.shared.not_empty.notify_all();
        }
    }
}

impl<T: Send> fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

/// Read end of a channel.
pub struct Source<T: Send> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Source<T> {
    /// Block until an item is available. `None` means end-of-stream.
    pub fn pop(&self) -> Option<T> {
        let shared = &*self.shared;
        let mut state = shared.lock();
        loop {
            if let Some(item) = Self::take(shared, &mut state) {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state.waiting_consumers += 1;
            state = shared
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            state.waiting_consumers -= 1;
        }
    }

    /// Pop with an upper bound on the wait.
    ///
    /// Returns `Ok(None)` at end-of-stream and `Err(())` on timeout.
    #[allow(clippy::result_unit_err)]
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>, ()> {
        let shared = &*self.shared;
        let deadline = Instant::now() + timeout;
        let mut state = shared.lock();
        loop {
            if let Some(item) = Self::take(shared, &mut state) {
                return Ok(Some(item));
            }
            if state.closed {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(());
            }
            state.waiting_consumers += 1;
            let (next, _) = shared
                .not_empty
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            state.waiting_consumers -= 1;
        }
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let shared = &*self.shared;
        let mut state = shared.lock();
        Self::take(shared, &mut state)
    }

    fn take(shared: &Shared<T>, state: &mut State<T>) -> Option<T> {
        let item = state.queue.pop_front()?;
        state.popped += 1;
        shared.not_full.notify_all();
        Some(item)
    }

    /// True once the channel is closed and fully drained.
    pub fn is_finished(&self) -> bool {
        let state = self.shared.lock();
        state.closed && state.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.stats()
    }

    pub fn probe(&self) -> ChannelProbe {
        ChannelProbe {
            inner: self.shared.clone(),
        }
    }
}

impl<T: Send> Drop for Source<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.disconnected = true;
        self.shared.not_full.notify_all();
    }
}

impl<T: Send> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

/// Read-only, type-erased view of a channel's occupancy.
#[derive(Clone)]
pub struct ChannelProbe {
    inner: Arc<dyn Occupancy>,
}

impl ChannelProbe {
    pub fn id(&self) -> ChannelId {
        self.inner.id()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ChannelStats {
        self.inner.stats()
    }
}

impl fmt::Debug for ChannelProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelProbe")
            .field("id", &self.inner.id())
            .field("name", &self.inner.name())
            .field("len", &self.inner.len())
            .finish()
    }
}
