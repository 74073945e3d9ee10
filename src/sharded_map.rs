use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use fnv::FnvBuildHasher;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A fixed-size, bucket-locked hash table.
///
/// The number of buckets is chosen at construction and never changes, so
/// the expected O(1) lookup degrades to a linear scan of a bucket once the
/// table holds many more entries than buckets.
///
/// Point operations lock exactly one bucket. Whole-table operations
/// (`clear`, `fold_readonly`, `for_each_readonly`) use strict two-phase
/// locking: every bucket lock is acquired in ascending index order before
/// any work is done, and all of them are held until the work is complete.
///
/// The mutating point operations take a callback that runs while the
/// bucket lock is held and *before* the in-memory change is committed. If
/// the callback fails, the table is left untouched and the error is
/// returned. This is what lets the storage engine write a log record for a
/// mutation with the same per-key ordering as the mutation itself.
pub struct ShardedMap<K, V, S = FnvBuildHasher> {
    buckets: Box<[RwLock<Vec<(K, V)>>]>,
    hasher: S,
}

impl<K, V> ShardedMap<K, V> {
    /// Create a table with `n_buckets` buckets. A request for zero buckets
    /// is treated as a request for one.
    pub fn new(n_buckets: usize) -> ShardedMap<K, V> {
        ShardedMap::with_hasher(n_buckets, FnvBuildHasher::default())
    }
}

impl<K, V, S> ShardedMap<K, V, S> {
    pub fn with_hasher(n_buckets: usize, hasher: S) -> ShardedMap<K, V, S> {
        let buckets = (0..n_buckets.max(1))
            .map(|_| RwLock::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        ShardedMap { buckets, hasher }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    // all whole-table operations go through these two so the lock order
    // is always ascending bucket index
    fn read_all(&self) -> Vec<RwLockReadGuard<'_, Vec<(K, V)>>> {
        self.buckets.iter().map(|bucket| bucket.read()).collect()
    }

    fn write_all(&self) -> Vec<RwLockWriteGuard<'_, Vec<(K, V)>>> {
        self.buckets.iter().map(|bucket| bucket.write()).collect()
    }

    /// Remove every entry from the table.
    pub fn clear(&self) {
        let mut guards = self.write_all();
        for bucket in guards.iter_mut() {
            bucket.clear();
        }
    }

    /// Visit every pair with all bucket locks held, threading an
    /// accumulator through the visits, then hand the accumulator to `then`
    /// before any lock is released.
    ///
    /// `then` is the hook for composing a scan of a second table into one
    /// logically atomic action: opening another table's scan from inside
    /// `then` keeps this table frozen until the nested scan finishes.
    pub fn fold_readonly<A, R, F, T>(&self, init: A, mut f: F, then: T) -> R
    where
        F: FnMut(&mut A, &K, &V),
        T: FnOnce(A) -> R,
    {
        let guards = self.read_all();

        let mut acc = init;
        for bucket in &guards {
            for (k, v) in bucket.iter() {
                f(&mut acc, k, v);
            }
        }

        let ret = then(acc);

        drop(guards);

        ret
    }

    /// Apply `f` to every pair with all bucket locks held, then run `then`
    /// while still holding them.
    pub fn for_each_readonly<R, F, T>(&self, mut f: F, then: T) -> R
    where
        F: FnMut(&K, &V),
        T: FnOnce() -> R,
    {
        self.fold_readonly((), |_, k, v| f(k, v), |_| then())
    }

    /// The number of entries, counted under a consistent view of every
    /// bucket.
    pub fn len(&self) -> usize {
        self.read_all().iter().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.read_all().iter().all(|bucket| bucket.is_empty())
    }
}

impl<K, V, S> ShardedMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn bucket_for<Q>(&self, key: &Q) -> &RwLock<Vec<(K, V)>>
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        let hash = self.hasher.hash_one(key);
        let idx = (hash % self.buckets.len() as u64) as usize;
        &self.buckets[idx]
    }

    /// Insert `key` iff it is absent.
    ///
    /// Returns `Ok(true)` if the pair was inserted and `Ok(false)` if the
    /// key already existed, in which case `on_success` is not called.
    pub fn insert<E, F>(
        &self,
        key: K,
        value: V,
        on_success: F,
    ) -> Result<bool, E>
    where
        F: FnOnce(&K, &V) -> Result<(), E>,
    {
        let mut bucket = self.bucket_for(&key).write();

        if bucket.iter().any(|(k, _)| *k == key) {
            return Ok(false);
        }

        on_success(&key, &value)?;
        bucket.push((key, value));

        Ok(true)
    }

    /// Insert `key` if absent, otherwise replace its value. Exactly one of
    /// the callbacks fires.
    ///
    /// Returns `Ok(true)` for an insert and `Ok(false)` for an update.
    pub fn upsert<E, I, U>(
        &self,
        key: K,
        value: V,
        on_insert: I,
        on_update: U,
    ) -> Result<bool, E>
    where
        I: FnOnce(&K, &V) -> Result<(), E>,
        U: FnOnce(&K, &V) -> Result<(), E>,
    {
        let mut bucket = self.bucket_for(&key).write();

        if let Some((k, v)) = bucket.iter_mut().find(|(k, _)| *k == key) {
            on_update(k, &value)?;
            *v = value;
            return Ok(false);
        }

        on_insert(&key, &value)?;
        bucket.push((key, value));

        Ok(true)
    }

    /// Apply `f` to the value for `key` under the bucket's exclusive lock.
    /// Returns `None` if the key is absent.
    pub fn mutate<Q, R, F>(&self, key: &Q, f: F) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V) -> R,
    {
        let mut bucket = self.bucket_for(key).write();

        bucket
            .iter_mut()
            .find(|(k, _)| k.borrow() == key)
            .map(|(_, v)| f(v))
    }

    /// Apply `f` to the value for `key` under the bucket's shared lock.
    /// Returns `None` if the key is absent.
    pub fn mutate_readonly<Q, R, F>(&self, key: &Q, f: F) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> R,
    {
        let bucket = self.bucket_for(key).read();

        bucket.iter().find(|(k, _)| k.borrow() == key).map(|(_, v)| f(v))
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.mutate_readonly(key, |_| ()).is_some()
    }

    /// Remove `key` if present. `on_success` sees the pair about to be
    /// removed.
    ///
    /// Returns `Ok(true)` if the key was found and removed.
    pub fn remove<Q, E, F>(&self, key: &Q, on_success: F) -> Result<bool, E>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&K, &V) -> Result<(), E>,
    {
        let mut bucket = self.bucket_for(key).write();

        let Some(idx) = bucket.iter().position(|(k, _)| k.borrow() == key)
        else {
            return Ok(false);
        };

        let (k, v) = &bucket[idx];
        on_success(k, v)?;

        bucket.swap_remove(idx);

        Ok(true)
    }
}

impl<K, V, S> fmt::Debug for ShardedMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedMap")
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}
