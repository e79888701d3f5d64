//! # Deterministic Command Queue
//!
//! Strict FIFO-by-arrival queue shared by every connection task (producers)
//! and the host main thread (the single consumer). Sequence numbers are
//! assigned under the queue lock, so arrival order and sequence order are
//! the same thing.
//!
//! The queue is bounded. Enqueueing into a full queue evicts the oldest
//! entry and hands it back to the caller so its owner can be told.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::execution::command::{ClientId, Command};

/// Ordering key: sequence first, command id as a tiebreaker for display
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    pub sequence: u64,
    pub command_id: String,
}

/// A queued command and the connection that sent it
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub command: Command,
    pub client: ClientId,
}

/// Result of an `enqueue`
#[derive(Debug)]
pub struct EnqueueReceipt {
    pub sequence: u64,
    /// Entry pushed out to make room, if the queue was full
    pub evicted: Option<QueueEntry>,
}

#[derive(Debug)]
struct QueueState {
    pending: BTreeMap<QueueKey, QueueEntry>,
    next_sequence: u64,
    total_enqueued: u64,
    total_evicted: u64,
}

#[derive(Debug)]
pub struct DeterministicCommandQueue {
    max_size: usize,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl DeterministicCommandQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            state: Mutex::new(QueueState {
                pending: BTreeMap::new(),
                next_sequence: 1,
                total_enqueued: 0,
                total_evicted: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Assign the next sequence to `command` and queue it
    pub fn enqueue(&self, mut command: Command, client: ClientId) -> EnqueueReceipt {
        let receipt = {
            let mut state = self.state.lock();

            let evicted = if state.pending.len() >= self.max_size {
                state.total_evicted += 1;
                state.pending.pop_first().map(|(_, entry)| entry)
            } else {
                None
            };

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.total_enqueued += 1;
            command.sequence = sequence;

            let key = QueueKey {
                sequence,
                command_id: command.id.clone(),
            };
            state.pending.insert(key, QueueEntry { command, client });

            EnqueueReceipt { sequence, evicted }
        };

        if let Some(entry) = &receipt.evicted {
            warn!(
                evicted_sequence = entry.command.sequence,
                evicted_id = %entry.command.id,
                client = %entry.client,
                max_size = self.max_size,
                "Command queue full, evicted oldest entry"
            );
        }

        self.available.notify_one();
        receipt
    }

    /// Pop the oldest entry, waiting up to `timeout` for one to arrive
    pub fn dequeue(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some((_, entry)) = state.pending.pop_first() {
                return Some(entry);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return state.pending.pop_first().map(|(_, entry)| entry);
            }
        }
    }

    /// Pop the oldest entry without waiting
    pub fn try_dequeue(&self) -> Option<QueueEntry> {
        self.state.lock().pending.pop_first().map(|(_, entry)| entry)
    }

    /// Remove and return everything, oldest first
    pub fn drain_all(&self) -> Vec<QueueEntry> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.pending).into_values().collect()
    }

    pub fn clear(&self) -> usize {
        self.drain_all().len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn total_evicted(&self) -> u64 {
        self.state.lock().total_evicted
    }

    pub fn total_enqueued(&self) -> u64 {
        self.state.lock().total_enqueued
    }
}
