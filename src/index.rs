use core::hash::{BuildHasher, Hash};
use core::mem;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::DefaultHashBuilder;
use parking_lot::RwLock;

use crate::list::Node;
use crate::resizer::{RehashTarget, ResizerShared};

/// Bucket count of the staging table that absorbs writes while a background
/// rehash is in flight.
const STAGING_BUCKETS: usize = 8;

/// Bucket count of a freshly constructed index before any sizing hint.
const DEFAULT_BUCKETS: usize = 16;

type Bucket<K, V> = Vec<(K, NonNull<Node<K, V>>)>;

struct IndexInner<K, V> {
    /// Main bucket array; its length is always a power of two.
    buckets: Box<[Bucket<K, V>]>,
    /// Present exactly while a background rehash is scheduled or running.
    /// Doubles as the resize-in-progress flag.
    staging: Option<Box<[Bucket<K, V>]>>,
    /// Entries across main and staging together.
    len: usize,
}

impl<K: Eq, V> IndexInner<K, V> {
    fn find(&self, hash: u64, key: &K) -> Option<NonNull<Node<K, V>>> {
        if let Some(staging) = &self.staging {
            let bucket = &staging[hash as usize & (STAGING_BUCKETS - 1)];
            if let Some((_, node)) = bucket.iter().find(|(k, _)| k == key) {
                return Some(*node);
            }
        }
        let bucket = &self.buckets[hash as usize & (self.buckets.len() - 1)];
        bucket
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, node)| *node)
    }
}

/// Chaining hash index mapping keys to node handles.
///
/// Each shard owns one index. Entries are `(key, node pointer)` pairs in
/// per-bucket vectors; the bucket is `hash & (len - 1)` with a power-of-two
/// bucket count. Inserts are insert-if-absent: an existing key is never
/// overwritten.
///
/// # Growth
///
/// When the element count passes twice the bucket count the table doubles.
/// With a resize coordinator attached, the table allocates the small staging
/// array (which flags the resize as in progress) and queues itself; writes
/// that arrive before the worker gets to it land in staging so they are not
/// starved by table growth, and reads consult both arrays. Without a
/// coordinator the table rehashes synchronously under the writer lock.
///
/// The entire rehash — copying the main array, draining staging, publishing
/// the new array — happens under one writer-lock acquisition, so a replaced
/// bucket array is dropped before any reader could still reference it.
///
/// # Safety
///
/// The stored node pointers are owned by the shard's list and arena. The
/// index dereferences them only in `lookup_value`, and only while holding the
/// reader lock: every path that frees a node removes it from the index first,
/// which requires the writer lock. Rehashing never dereferences handles (the
/// key copy stored beside the handle is rehashed instead), so a worker may
/// outlive the nodes of an already-dropped shard.
pub(crate) struct HashIndex<K, V, S = DefaultHashBuilder> {
    inner: RwLock<IndexInner<K, V>>,
    hasher: S,
    rehashes: AtomicU64,
    resizer: Option<ResizerBinding>,
}

struct ResizerBinding {
    pool: Arc<ResizerShared>,
    /// Handle to this very table, queued when growth trips the threshold.
    table: Weak<dyn RehashTarget>,
}

// SAFETY: the raw node pointers inside are only dereferenced under the lock
// discipline described on the struct; key/value ownership moves with K and V.
unsafe impl<K: Send, V: Send, S: Send> Send for HashIndex<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send + Sync> Sync for HashIndex<K, V, S> {}

impl<K, V, S> HashIndex<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates an index that rehashes synchronously, without a coordinator.
    pub(crate) fn with_hasher(hasher: S) -> Arc<Self> {
        Arc::new(HashIndex {
            inner: RwLock::new(IndexInner {
                buckets: alloc_buckets(DEFAULT_BUCKETS),
                staging: None,
                len: 0,
            }),
            hasher,
            rehashes: AtomicU64::new(0),
            resizer: None,
        })
    }

    /// Creates an index bound to a resize coordinator.
    pub(crate) fn with_resizer(hasher: S, pool: Arc<ResizerShared>) -> Arc<Self>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
        S: Send + Sync + 'static,
    {
        Arc::new_cyclic(|me: &Weak<HashIndex<K, V, S>>| HashIndex {
            inner: RwLock::new(IndexInner {
                buckets: alloc_buckets(DEFAULT_BUCKETS),
                staging: None,
                len: 0,
            }),
            hasher,
            rehashes: AtomicU64::new(0),
            resizer: Some(ResizerBinding {
                pool,
                table: me.clone() as Weak<dyn RehashTarget>,
            }),
        })
    }

    #[inline]
    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Looks up the node handle for a key.
    pub(crate) fn lookup(&self, key: &K) -> Option<NonNull<Node<K, V>>> {
        let inner = self.inner.read();
        inner.find(self.hash(key), key)
    }

    /// Looks up a key and copies its value out under the reader lock.
    ///
    /// This is the only place the index dereferences a node handle. It is
    /// sound without the shard mutex: the entry's presence in the table means
    /// the node has not been freed, because every free happens after an index
    /// removal that needs the writer lock this reader lock excludes.
    pub(crate) fn lookup_value(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let inner = self.inner.read();
        let node = inner.find(self.hash(key), key)?;
        // SAFETY: see above; the node is live while we hold the reader lock.
        Some(unsafe { node.as_ref().value().clone() })
    }

    /// Inserts a key → node mapping if the key is absent.
    ///
    /// Returns false and leaves the table untouched when the key is already
    /// present in either array. A successful insert that pushes the table
    /// past its growth threshold either schedules a background rehash or, if
    /// no coordinator is attached, rehashes before returning.
    pub(crate) fn insert(&self, key: K, node: NonNull<Node<K, V>>) -> bool {
        let hash = self.hash(&key);
        let mut inner = self.inner.write();
        if inner.find(hash, &key).is_some() {
            return false;
        }
        {
            let IndexInner {
                buckets,
                staging,
                len,
            } = &mut *inner;
            match staging.as_mut() {
                Some(staging) => {
                    staging[hash as usize & (STAGING_BUCKETS - 1)].push((key, node));
                }
                None => {
                    let mask = buckets.len() - 1;
                    buckets[hash as usize & mask].push((key, node));
                }
            }
            *len += 1;
        }

        if inner.staging.is_none() && inner.len > 2 * inner.buckets.len() {
            match &self.resizer {
                Some(binding) => {
                    inner.staging = Some(alloc_buckets(STAGING_BUCKETS));
                    binding.pool.enqueue(binding.table.clone());
                }
                None => self.rehash_locked(&mut inner),
            }
        }
        true
    }

    /// Removes a key, returning the node handle it mapped to.
    ///
    /// The staging array is scanned first; a key written during a pending
    /// rehash lives there and nowhere else.
    pub(crate) fn remove(&self, key: &K) -> Option<NonNull<Node<K, V>>> {
        let hash = self.hash(key);
        let mut inner = self.inner.write();
        let IndexInner {
            buckets,
            staging,
            len,
        } = &mut *inner;
        if let Some(staging) = staging.as_mut() {
            let bucket = &mut staging[hash as usize & (STAGING_BUCKETS - 1)];
            if let Some(pos) = bucket.iter().position(|(k, _)| k == key) {
                let (_, node) = bucket.swap_remove(pos);
                *len -= 1;
                return Some(node);
            }
        }
        let mask = buckets.len() - 1;
        let bucket = &mut buckets[hash as usize & mask];
        let pos = bucket.iter().position(|(k, _)| k == key)?;
        let (_, node) = bucket.swap_remove(pos);
        *len -= 1;
        Some(node)
    }

    /// Rebuilds the main array at the smallest power of two >= `n` buckets,
    /// carrying all entries over. Used to pre-size a fresh index.
    pub(crate) fn set_size(&self, n: usize) {
        let target = n.next_power_of_two().max(1);
        let mut inner = self.inner.write();
        self.rebuild_locked(&mut inner, target);
    }

    /// Doubles the main array and merges staging back in. One writer-lock
    /// acquisition covers the copy, the drain, and the publication.
    fn rehash_locked(&self, inner: &mut IndexInner<K, V>) {
        let new_len = inner.buckets.len() * 2;
        self.rebuild_locked(inner, new_len);
        self.rehashes.fetch_add(1, Ordering::Relaxed);
    }

    fn rebuild_locked(&self, inner: &mut IndexInner<K, V>, new_len: usize) {
        debug_assert!(new_len.is_power_of_two());
        let mut new_buckets = alloc_buckets(new_len);
        let mask = new_len - 1;
        let old = mem::take(&mut inner.buckets);
        for bucket in old.into_vec() {
            for (key, node) in bucket {
                new_buckets[self.hash(&key) as usize & mask].push((key, node));
            }
        }
        if let Some(staging) = inner.staging.take() {
            for bucket in staging.into_vec() {
                for (key, node) in bucket {
                    new_buckets[self.hash(&key) as usize & mask].push((key, node));
                }
            }
        }
        inner.buckets = new_buckets;
    }
}

impl<K, V, S> HashIndex<K, V, S> {
    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.inner.read().len
    }

    #[allow(dead_code)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.inner.read().buckets.len()
    }

    /// Completed grow rehashes (synchronous and background).
    pub(crate) fn rehash_count(&self) -> u64 {
        self.rehashes.load(Ordering::Relaxed)
    }

    /// Drops every entry. Bucket arrays keep their sizes; a rehash that was
    /// scheduled but has not run yet finds nothing to do.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.write();
        for bucket in inner.buckets.iter_mut() {
            bucket.clear();
        }
        inner.staging = None;
        inner.len = 0;
    }
}

impl<K, V, S> RehashTarget for HashIndex<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Send + Sync,
{
    fn rehash(&self) {
        let mut inner = self.inner.write();
        // A Clear may have raced the queue entry; without the staging array
        // there is no pending rehash and the table is left alone.
        if inner.staging.is_none() {
            return;
        }
        self.rehash_locked(&mut inner);
    }
}

fn alloc_buckets<K, V>(n: usize) -> Box<[Bucket<K, V>]> {
    (0..n).map(|_| Vec::new()).collect::<Vec<_>>().into()
}
