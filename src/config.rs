//! Cache configuration.
//!
//! One struct with public fields configures the whole cache: create it with
//! [`ShardedLruCacheConfig::with_per_shard_capacity`] and override the knobs
//! you care about.
//!
//! # Examples
//!
//! ```
//! use sharded_lru::{ReaderPolicy, ShardedLruCacheConfig};
//! use std::num::NonZeroUsize;
//!
//! let mut config = ShardedLruCacheConfig::with_per_shard_capacity(
//!     NonZeroUsize::new(1000).unwrap(),
//! );
//! config.shard_bits = 3; // 8 shards
//! config.reader_policy = ReaderPolicy::Shared;
//!
//! assert_eq!(config.shard_count(), 8);
//! assert_eq!(config.total_capacity(), 8000);
//! ```

use core::fmt;
use core::num::NonZeroUsize;

/// How a shard serves `find`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReaderPolicy {
    /// The shard mutex covers the whole find: index probe, value copy, and
    /// front-promotion. Linearizable and simple; the default.
    #[default]
    Exclusive,
    /// The value is copied under the index's reader lock without touching the
    /// shard mutex; the front-promotion then runs under a try-lock and is
    /// skipped when the shard is contended or the entry has gone away. Under
    /// heavy read contention a skipped promotion merely weakens the LRU
    /// signal by one access.
    Shared,
}

/// How a shard stores its nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeAllocator {
    /// One heap allocation per node; the default.
    #[default]
    Heap,
    /// `capacity` node slots preallocated per shard with a free list.
    /// Removes per-operation allocation traffic and improves locality.
    Slab,
}

/// Configuration for a [`ShardedLruCache`](crate::ShardedLruCache).
///
/// All fields are public; construct with
/// [`with_per_shard_capacity`](Self::with_per_shard_capacity) and adjust.
///
/// # Fields
///
/// - `shard_bits`: the cache has `2^shard_bits` shards
/// - `per_shard_capacity`: entries each shard can hold; the cache's total
///   capacity is `per_shard_capacity * 2^shard_bits`
/// - `resize_workers`: background threads rehashing indices that outgrow
///   their bucket arrays; 0 rehashes inline on the inserting thread
/// - `reader_policy`: see [`ReaderPolicy`]
/// - `node_allocator`: see [`NodeAllocator`]
/// - `insert_buffer_capacity`: when set, inserts accumulate per shard and are
///   applied in batches under a single shard-lock acquisition; buffered
///   entries are invisible to `find` and `len` until the batch is applied
#[derive(Clone, Copy)]
pub struct ShardedLruCacheConfig {
    /// The cache has `2^shard_bits` shards. At most 16.
    pub shard_bits: u32,
    /// Entries each shard can hold.
    pub per_shard_capacity: NonZeroUsize,
    /// Background rehash threads; 0 disables the pool.
    pub resize_workers: usize,
    /// Find path locking, see [`ReaderPolicy`].
    pub reader_policy: ReaderPolicy,
    /// Node storage strategy, see [`NodeAllocator`].
    pub node_allocator: NodeAllocator,
    /// Per-shard insert batching; `None` applies inserts immediately.
    pub insert_buffer_capacity: Option<NonZeroUsize>,
}

impl ShardedLruCacheConfig {
    /// A default configuration for the given per-shard capacity: 16 shards,
    /// one background resize worker, exclusive readers, heap nodes, no
    /// insert buffering.
    pub fn with_per_shard_capacity(per_shard_capacity: NonZeroUsize) -> Self {
        ShardedLruCacheConfig {
            shard_bits: 4,
            per_shard_capacity,
            resize_workers: 1,
            reader_policy: ReaderPolicy::default(),
            node_allocator: NodeAllocator::default(),
            insert_buffer_capacity: None,
        }
    }

    /// Number of shards, `2^shard_bits`.
    #[inline]
    pub fn shard_count(&self) -> usize {
        1usize << self.shard_bits
    }

    /// Total entry capacity across all shards.
    #[inline]
    pub fn total_capacity(&self) -> usize {
        self.per_shard_capacity.get() * self.shard_count()
    }
}

impl fmt::Debug for ShardedLruCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedLruCacheConfig")
            .field("shard_bits", &self.shard_bits)
            .field("per_shard_capacity", &self.per_shard_capacity)
            .field("resize_workers", &self.resize_workers)
            .field("reader_policy", &self.reader_policy)
            .field("node_allocator", &self.node_allocator)
            .field("insert_buffer_capacity", &self.insert_buffer_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config =
            ShardedLruCacheConfig::with_per_shard_capacity(NonZeroUsize::new(100).unwrap());
        assert_eq!(config.shard_bits, 4);
        assert_eq!(config.shard_count(), 16);
        assert_eq!(config.total_capacity(), 1600);
        assert_eq!(config.resize_workers, 1);
        assert_eq!(config.reader_policy, ReaderPolicy::Exclusive);
        assert_eq!(config.node_allocator, NodeAllocator::Heap);
        assert!(config.insert_buffer_capacity.is_none());
    }

    #[test]
    fn single_shard() {
        let mut config =
            ShardedLruCacheConfig::with_per_shard_capacity(NonZeroUsize::new(10).unwrap());
        config.shard_bits = 0;
        assert_eq!(config.shard_count(), 1);
        assert_eq!(config.total_capacity(), 10);
    }
}
