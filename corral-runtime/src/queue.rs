//! Deduplicating, time-released job queue with on-hold semantics
//!
//! The queue is owned by a single serializer task; callers communicate
//! over channels, so producers and consumers never touch the internals
//! and the on-hold invariant is structurally enforced: a key handed to a
//! worker cannot be handed to another until it is released.
//!
//! Scheduling rules:
//! - `put` inserts or refreshes the item with release-time *now*; the new
//!   value always wins, the earlier release-time wins.
//! - a `put` for a key currently on hold stashes the value as *pending*,
//!   re-queued the moment the key is released.
//! - `release` with a requeue interval re-queues the held value at
//!   `now + interval`, unless a fresher pending value exists.
//! - items due at the same instant are served FIFO.

use hashbrown::HashMap;
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    hash::Hash,
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};

enum Command<K, V> {
    Put(K, V),
    Release(K, Option<Duration>),
    Get(oneshot::Sender<(K, V)>),
    Close,
}

/// A handle to the queue; cloning shares the underlying serializer.
pub struct JobQueue<K, V> {
    cmd_tx: mpsc::UnboundedSender<Command<K, V>>,
    len: Arc<AtomicUsize>,
}

impl<K, V> Clone for JobQueue<K, V> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            len: self.len.clone(),
        }
    }
}

impl<K, V> JobQueue<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create the queue, spawning its serializer task.
    #[must_use]
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let len = Arc::new(AtomicUsize::new(0));
        let serializer = Serializer {
            scheduled: HashMap::new(),
            heap: BinaryHeap::new(),
            on_hold: HashMap::new(),
            waiters: VecDeque::new(),
            pending_count: 0,
            next_seq: 0,
            len: len.clone(),
        };
        tokio::spawn(serializer.run(cmd_rx));
        Self { cmd_tx, len }
    }

    /// Insert or refresh an item; non-blocking.
    pub fn put(&self, key: K, value: V) {
        let _ = self.cmd_tx.send(Command::Put(key, value));
    }

    /// Pop the earliest due item, marking its key on hold. Blocks until an
    /// item is due; returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<(K, V)> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Get(tx)).ok()?;
        rx.await.ok()
    }

    /// Clear the on-hold state for `key`, optionally re-queuing it after
    /// the given interval. A pending value recorded while the key was on
    /// hold is re-queued immediately instead, since it is fresher.
    pub fn release(&self, key: K, requeue_after: Option<Duration>) {
        let _ = self.cmd_tx.send(Command::Release(key, requeue_after));
    }

    /// Outstanding items: ready plus pending; keys on hold with nothing
    /// pending are not counted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::SeqCst)
    }

    /// Whether no items are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut the queue down; blocked and future `get`s return `None`.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

impl<K, V> Default for JobQueue<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct Scheduled<V> {
    value: V,
    release_at: Instant,
    seq: u64,
}

struct Hold<V> {
    held: V,
    pending: Option<V>,
}

struct HeapEntry<K> {
    release_at: Instant,
    seq: u64,
    key: K,
}

// Ordered by (release_at, seq) only; seq is unique, giving FIFO among
// items due at the same instant. Reversed so the BinaryHeap pops earliest.
impl<K> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<K> Eq for HeapEntry<K> {}

impl<K> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for HeapEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.release_at, other.seq).cmp(&(self.release_at, self.seq))
    }
}

/// The serializer task state. `scheduled` is the canonical representation
/// of an item; heap entries whose seq does not match are stale and are
/// dropped lazily.
struct Serializer<K, V> {
    scheduled: HashMap<K, Scheduled<V>>,
    heap: BinaryHeap<HeapEntry<K>>,
    on_hold: HashMap<K, Hold<V>>,
    waiters: VecDeque<oneshot::Sender<(K, V)>>,
    pending_count: usize,
    next_seq: u64,
    len: Arc<AtomicUsize>,
}

impl<K, V> Serializer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn schedule(&mut self, key: K, value: V, release_at: Instant) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let release_at = match self.scheduled.get(&key) {
            Some(existing) if existing.release_at < release_at => existing.release_at,
            _ => release_at,
        };
        self.scheduled.insert(key.clone(), Scheduled {
            value,
            release_at,
            seq,
        });
        self.heap.push(HeapEntry {
            release_at,
            seq,
            key,
        });
    }

    fn put(&mut self, key: K, value: V) {
        if let Some(hold) = self.on_hold.get_mut(&key) {
            if hold.pending.replace(value).is_none() {
                self.pending_count += 1;
            }
            return;
        }
        self.schedule(key, value, Instant::now());
    }

    fn release(&mut self, key: K, requeue_after: Option<Duration>) {
        let Some(hold) = self.on_hold.remove(&key) else {
            tracing::debug!("release of a key that is not on hold");
            return;
        };
        if let Some(pending) = hold.pending {
            self.pending_count -= 1;
            self.schedule(key, pending, Instant::now());
        } else if let Some(after) = requeue_after {
            self.schedule(key, hold.held, Instant::now() + after);
        }
    }

    fn pop_due(&mut self, now: Instant) -> Option<(K, V)> {
        loop {
            let entry = self.heap.peek()?;
            let live = self
                .scheduled
                .get(&entry.key)
                .map(|scheduled| scheduled.seq == entry.seq)
                .unwrap_or(false);
            if !live {
                self.heap.pop();
                continue;
            }
            if entry.release_at > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry vanished");
            let scheduled = self
                .scheduled
                .remove(&entry.key)
                .expect("scheduled entry vanished");
            return Some((entry.key, scheduled.value));
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let entry = self.heap.peek()?;
            let live = self
                .scheduled
                .get(&entry.key)
                .map(|scheduled| scheduled.seq == entry.seq)
                .unwrap_or(false);
            if live {
                return Some(entry.release_at);
            }
            self.heap.pop();
        }
    }

    fn publish_len(&self) {
        self.len
            .store(self.scheduled.len() + self.pending_count, AtomicOrdering::SeqCst);
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command<K, V>>) {
        loop {
            while !self.waiters.is_empty() {
                let now = Instant::now();
                let Some((key, value)) = self.pop_due(now) else {
                    break;
                };
                let waiter = self.waiters.pop_front().expect("waiter vanished");
                let held = value.clone();
                if waiter.send((key.clone(), value)).is_ok() {
                    self.on_hold.insert(key, Hold {
                        held,
                        pending: None,
                    });
                } else {
                    // The getter went away; the item stays due.
                    self.schedule(key, held, now);
                }
            }
            self.publish_len();

            // The timer is re-armed to the earliest release after every
            // structural change; it only matters while a getter waits.
            let deadline = if self.waiters.is_empty() {
                None
            } else {
                self.next_deadline()
            };
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Put(key, value)) => self.put(key, value),
                    Some(Command::Release(key, after)) => self.release(key, after),
                    Some(Command::Get(tx)) => self.waiters.push_back(tx),
                    Some(Command::Close) | None => break,
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
        }
        // Dropping the waiters resolves outstanding and future gets to None.
    }
}
