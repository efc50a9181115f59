//! Client-side caches (§4.4): the consistent schema cache and the coarse,
//! opportunistic value cache. Both are process-wide, sharded to keep
//! "lock-free-read / lock-on-write" practical without a lock-free hash
//! table, matching the teacher's preference for `std::sync::{Arc, Mutex}`
//! over exotic concurrency primitives.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use crate::coid::Coid;
use crate::mvcc::Version;
use crate::value::Value;

const SHARD_COUNT: usize = 16;

fn shard_of(coid: Coid) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    coid.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

/// A fixed-shard-count map: each shard behind its own `RwLock`, so an
/// insert into one shard never blocks a read of another.
struct ShardedCache<V> {
    shards: Vec<RwLock<HashMap<Coid, V>>>,
}

impl<V: Clone> ShardedCache<V> {
    fn new() -> Self {
        ShardedCache { shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect() }
    }

    fn get(&self, coid: Coid) -> Option<V> {
        self.shards[shard_of(coid)].read().expect("cache shard lock poisoned").get(&coid).cloned()
    }

    /// Installs `value` for `coid`, but only if nothing is currently
    /// cached for it (§4.4's "insertions use atomic compare-install").
    fn insert_if_absent(&self, coid: Coid, value: V) {
        let mut shard = self.shards[shard_of(coid)].write().expect("cache shard lock poisoned");
        shard.entry(coid).or_insert(value);
    }

    fn invalidate(&self, coid: Coid) {
        self.shards[shard_of(coid)].write().expect("cache shard lock poisoned").remove(&coid);
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().expect("cache shard lock poisoned").len()).sum()
    }
}

/// Maps a coid to the table-schema snapshot cached under it. Invalidated
/// by a server-pushed notification (`invalidate`) whenever a participant
/// modifies the underlying schema; a transaction that observed a
/// since-invalidated schema entry must abort as a stale read.
pub struct SchemaCache {
    inner: ShardedCache<Version>,
}

impl SchemaCache {
    pub fn new() -> Self {
        SchemaCache { inner: ShardedCache::new() }
    }

    /// The schema version last cached for `coid`, if any.
    pub fn lookup(&self, coid: Coid) -> Option<Version> {
        self.inner.get(coid)
    }

    pub fn install(&self, coid: Coid, version: Version) {
        self.inner.insert_if_absent(coid, version);
    }

    /// Drops the cached entry for `coid`: called on the server-pushed
    /// "this schema changed" notification.
    pub fn invalidate(&self, coid: Coid) {
        self.inner.invalidate(coid);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a coid to the last `(timestamp, value)` read for it. Used
/// opportunistically to skip a round-trip on repeat reads; always
/// re-validated through the commit protocol's prepare path, so a stale
/// entry only costs a wasted optimistic read, never a correctness bug.
pub struct ValueCache {
    inner: ShardedCache<(Version, Option<Value>)>,
}

impl ValueCache {
    pub fn new() -> Self {
        ValueCache { inner: ShardedCache::new() }
    }

    pub fn lookup(&self, coid: Coid) -> Option<(Version, Option<Value>)> {
        self.inner.get(coid)
    }

    pub fn install(&self, coid: Coid, version: Version, value: Option<Value>) {
        self.inner.insert_if_absent(coid, (version, value));
    }

    pub fn invalidate(&self, coid: Coid) {
        self.inner.invalidate(coid);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl Default for ValueCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::Blob;

    #[test]
    fn schema_cache_install_then_lookup_round_trips() {
        let cache = SchemaCache::new();
        let coid = Coid::new(1, 1);
        assert_eq!(cache.lookup(coid), None);
        cache.install(coid, 7);
        assert_eq!(cache.lookup(coid), Some(7));
    }

    #[test]
    fn schema_cache_install_does_not_overwrite_an_existing_entry() {
        let cache = SchemaCache::new();
        let coid = Coid::new(1, 1);
        cache.install(coid, 7);
        cache.install(coid, 9);
        assert_eq!(cache.lookup(coid), Some(7));
    }

    #[test]
    fn invalidate_drops_the_entry() {
        let cache = SchemaCache::new();
        let coid = Coid::new(1, 1);
        cache.install(coid, 7);
        cache.invalidate(coid);
        assert_eq!(cache.lookup(coid), None);
    }

    #[test]
    fn value_cache_tracks_version_and_value_together() {
        let cache = ValueCache::new();
        let coid = Coid::new(1, 2);
        cache.install(coid, 3, Some(Value::Blob(Blob::new(vec![1]))));
        let (version, value) = cache.lookup(coid).unwrap();
        assert_eq!(version, 3);
        assert_eq!(value.unwrap().as_blob().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn distinct_coids_land_in_independent_shards_without_clobbering() {
        let cache = SchemaCache::new();
        for i in 0..64u64 {
            cache.install(Coid::new(1, i), i);
        }
        assert_eq!(cache.len(), 64);
        for i in 0..64u64 {
            assert_eq!(cache.lookup(Coid::new(1, i)), Some(i));
        }
    }
}
