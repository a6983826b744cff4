//! Optional per-shard insert batching.
//!
//! With buffering enabled, inserts accumulate here under the buffer's own
//! mutex; once the batch is full the shard applies it under a single
//! shard-mutex acquisition. This amortizes lock traffic on write-heavy
//! workloads at the cost of delayed visibility: buffered entries are not
//! consulted by `find` or counted by `len` until the batch is applied, and
//! `clear` discards them.

/// Pending inserts for one shard. Callers lock it with the shard's buffer
/// mutex.
pub(crate) struct InsertBuffer<K, V> {
    pending: Vec<(K, V)>,
    capacity: usize,
}

impl<K, V> InsertBuffer<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        InsertBuffer {
            pending: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    pub(crate) fn push(&mut self, key: K, value: V) {
        self.pending.push((key, value));
    }

    /// Takes the whole batch, leaving the buffer empty.
    pub(crate) fn drain(&mut self) -> Vec<(K, V)> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
