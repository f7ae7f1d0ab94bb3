//! Consistency Queues
//!
//! Per-key request ordering in front of the dispatcher. Requests are grouped by
//! [`QueueKey`]; the dispatcher pulls round-robin across keys, so a key that is not
//! ready never blocks the others.
//!
//! ## Protocols
//! - **Async** (`AsyncQueue`): one FIFO per key, served strictly in arrival order.
//! - **Sync** (`SyncQueue`): N puts then N gets per key, N being the number of worker
//!   groups. The very first write for a key flips straight to the get phase, so the
//!   initial value is readable without waiting for N copies.
//!
//! CONTAINS probes take no part in either protocol's rounds. They wait behind queued
//! writes of their key and are never counted.
//!
//! A dequeued request is pending until the dispatcher calls `complete`: served requests
//! advance the key's protocol state, unserved ones go back to the tail of their sub-queue.

use super::types::{Phase, QueueKey};
use crate::error::{Error, Result};
use crate::sync::{read, write};
use crate::transport::types::{Message, Tag};

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

pub trait RequestQueue: Send + Sync {
    /// Adds a request. Fails if the producer broke the protocol.
    fn enqueue(&self, msg: Message) -> Result<()>;

    /// Next servable request, round-robin across keys. Never blocks.
    fn next_request(&self) -> Option<Message>;

    /// Reports the outcome of a request returned by `next_request`.
    fn complete(&self, msg: Message, served: bool);

    /// Requests waiting in sub-queues (in-flight ones excluded).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Protocol state of one key.
pub trait KeyState: Send + Sync {
    fn new(groups: usize) -> Self;

    fn push(&mut self, msg: Message) -> Result<()>;

    fn pop(&mut self) -> Option<Message>;

    fn complete(&mut self, msg: Message, served: bool);
}

/// Requests of one key in arrival order.
#[derive(Debug, Default)]
pub struct FifoState {
    queue: VecDeque<Message>,
}

impl KeyState for FifoState {
    fn new(_groups: usize) -> Self {
        Self::default()
    }

    fn push(&mut self, msg: Message) -> Result<()> {
        self.queue.push_back(msg);
        Ok(())
    }

    fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    fn complete(&mut self, msg: Message, served: bool) {
        if !served {
            self.queue.push_back(msg);
        }
    }
}

/// N-put/N-get state machine of one key.
#[derive(Debug)]
pub struct PhasedState {
    groups: usize,
    puts: VecDeque<Message>,
    gets: VecDeque<Message>,
    /// CONTAINS probes, outside the put/get rounds.
    probes: VecDeque<Message>,
    counter: usize,
    phase: Phase,
    first_update: bool,
}

impl PhasedState {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    fn sub_queue(&mut self, phase: Phase) -> &mut VecDeque<Message> {
        match phase {
            Phase::Put => &mut self.puts,
            Phase::Get => &mut self.gets,
        }
    }

    fn flip(&mut self) {
        self.phase = match self.phase {
            Phase::Put => Phase::Get,
            Phase::Get => Phase::Put,
        };
        self.counter = 0;
    }
}

impl KeyState for PhasedState {
    fn new(groups: usize) -> Self {
        Self {
            groups: groups.max(1),
            puts: VecDeque::new(),
            gets: VecDeque::new(),
            probes: VecDeque::new(),
            counter: 0,
            phase: Phase::Put,
            first_update: true,
        }
    }

    fn push(&mut self, msg: Message) -> Result<()> {
        if msg.tag == Tag::ContainsRequest {
            self.probes.push_back(msg);
            return Ok(());
        }

        let groups = self.groups;
        let phase = Phase::of(msg.tag);
        let queue = self.sub_queue(phase);
        if queue.len() >= groups {
            return Err(Error::ProtocolViolation(format!(
                "more than {} pending {:?}-phase requests for one key of table {}",
                groups, phase, msg.table
            )));
        }
        queue.push_back(msg);
        Ok(())
    }

    fn pop(&mut self) -> Option<Message> {
        if self.puts.is_empty()
            && let Some(msg) = self.probes.pop_front()
        {
            return Some(msg);
        }

        let phase = self.phase;
        self.sub_queue(phase).pop_front()
    }

    fn complete(&mut self, msg: Message, served: bool) {
        if msg.tag == Tag::ContainsRequest {
            if !served {
                self.probes.push_back(msg);
            }
            return;
        }
        if !served {
            self.sub_queue(Phase::of(msg.tag)).push_back(msg);
            return;
        }

        self.counter += 1;
        match self.phase {
            Phase::Put if self.first_update => {
                self.first_update = false;
                self.flip();
            }
            _ if self.counter >= self.groups => self.flip(),
            _ => {}
        }
    }
}

/// Round-robin over per-key states.
pub struct KeyedQueue<S> {
    groups: usize,
    states: DashMap<QueueKey, S>,
    /// Serving order; written only when a key is first seen.
    order: RwLock<Vec<QueueKey>>,
    cursor: AtomicUsize,
    pending: AtomicUsize,
}

pub type AsyncQueue = KeyedQueue<FifoState>;
pub type SyncQueue = KeyedQueue<PhasedState>;

impl<S: KeyState> KeyedQueue<S> {
    pub fn new(groups: usize) -> Self {
        Self {
            groups,
            states: DashMap::new(),
            order: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
        }
    }

    /// Number of distinct keys seen so far.
    pub fn key_count(&self) -> usize {
        read(&self.order).len()
    }
}

impl AsyncQueue {
    pub fn fifo() -> Self {
        Self::new(1)
    }
}

impl SyncQueue {
    pub fn phase_of(&self, key: &QueueKey) -> Option<Phase> {
        self.states.get(key).map(|state| state.phase())
    }

    pub fn counter_of(&self, key: &QueueKey) -> Option<usize> {
        self.states.get(key).map(|state| state.counter())
    }
}

impl<S: KeyState> RequestQueue for KeyedQueue<S> {
    fn enqueue(&self, msg: Message) -> Result<()> {
        let key = QueueKey::of(&msg);

        if !self.states.contains_key(&key) {
            let mut order = write(&self.order);
            if !self.states.contains_key(&key) {
                self.states.insert(key.clone(), S::new(self.groups));
                order.push(key.clone());
            }
        }

        let mut state = self
            .states
            .get_mut(&key)
            .ok_or_else(|| Error::ProtocolViolation("queue key vanished".into()))?;
        state.push(msg)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn next_request(&self) -> Option<Message> {
        let order = read(&self.order);
        let n = order.len();
        if n == 0 {
            return None;
        }

        let start = self.cursor.load(Ordering::SeqCst) % n;
        for step in 0..n {
            let idx = (start + step) % n;
            let Some(mut state) = self.states.get_mut(&order[idx]) else {
                continue;
            };
            if let Some(msg) = state.pop() {
                self.cursor.store(idx + 1, Ordering::SeqCst);
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return Some(msg);
            }
        }
        None
    }

    fn complete(&self, msg: Message, served: bool) {
        let key = QueueKey::of(&msg);
        match self.states.get_mut(&key) {
            Some(mut state) => {
                if !served {
                    self.pending.fetch_add(1, Ordering::SeqCst);
                }
                state.complete(msg, served);
            }
            None => tracing::error!("Completed request for unknown key of table {}", key.table),
        }
    }

    fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}
