#![doc = include_str!("../README.md")]
//!
//! ---
//!
//! # Architecture
//!
//! One operation flows: caller → router (hash, shard select) → shard engine
//! (shard mutex) → index lookup → recency-list splice or eviction → index
//! insert/remove → unlock. The resize coordinator talks only to indices,
//! asynchronously; the shard engine never sees it.
//!
//! | Module | Role |
//! |--------|------|
//! | [`cache`] | the sharded front end and public surface |
//! | [`config`] | configuration knobs |
//! | [`metrics`] | hit/miss/eviction counters and reporting |
//!
//! Internal modules (not part of the public API): the intrusive recency
//! list, the chaining hash index with its staging table, the background
//! resize worker pool, the node arena, and the optional insert buffer.
//!
//! # Locking model
//!
//! - One mutex per shard guards that shard's recency list, node storage and
//!   size counter. No operation ever holds two shard locks.
//! - Each index carries its own reader-writer lock. Shard operations take it
//!   briefly inside the shard mutex (always in that order, so the lock
//!   hierarchy is acyclic); the background worker takes the writer lock for
//!   the duration of one rehash and never touches shard mutexes.
//! - The resize coordinator has one queue mutex and condition variable.
//!
//! Operations on the same shard are linearizable in mutex-acquisition order;
//! operations on distinct shards are unordered. Publication of a grown
//! bucket array happens inside the writer lock, so any later index operation
//! observes it.

/// The sharded cache front end.
pub mod cache;

/// Cache configuration structures.
pub mod config;

/// Metrics collection and reporting.
pub mod metrics;

/// Node storage strategies (heap or preallocated slab).
mod arena;

/// Optional per-shard insert batching.
mod buffer;

/// The chaining hash index with incremental background resizing.
mod index;

/// Intrusive doubly-linked recency list.
///
/// Internal infrastructure with raw-pointer operations; use the cache types
/// instead.
mod list;

/// Background worker pool that rehashes indices on demand.
mod resizer;

/// The per-shard LRU engine composing list and index under the shard mutex.
mod shard;

pub use cache::ShardedLruCache;
pub use config::{NodeAllocator, ReaderPolicy, ShardedLruCacheConfig};
pub use metrics::CacheMetrics;

/// Key type of the canonical configuration.
pub type DefaultKey = i64;

/// Value type of the canonical configuration: 16 opaque bytes.
pub type DefaultValue = [u8; 16];
