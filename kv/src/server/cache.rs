//! Server-side per-COID cache and operation log (§4.2 of the component
//! design). Each COID keeps a chain of logged mutations plus an optional
//! materialized snapshot; the chain is folded into a fresh snapshot once it
//! grows past the configured thresholds, or once its oldest entry ages past
//! the retention window. Mirrors `GlobalCache`/`GlobalCacheEntry` from
//! `kvinterface.h`, replacing the C++ skip-list bucket table with a
//! `RwLock<HashMap<Coid, Arc<Mutex<Chain>>>>` and per-COID `Mutex` locking,
//! per §5's "each COID's log chain is protected by a per-COID lock."

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::coid::Coid;
use crate::config::Config;
use crate::error::{AbortReason, CResult, Error};
use crate::mvcc::Version;
use crate::value::{IntervalKind, Value};

/// One logged mutation against a COID, in commit order. Mirrors the
/// mutation verbs of §4.3 (`Put`/`Put2`/`Put3` collapse to `Put`, since the
/// gather-write optimization only matters for the wire encoding).
#[derive(Clone, Debug)]
pub enum LogOp {
    Put(Value),
    Delete,
    DeleteRange { lo: i64, hi: i64, kind: IntervalKind },
    SetAttr { id: u32, value: u64 },
}

#[derive(Clone, Debug)]
struct LogEntry {
    version: Version,
    op: LogOp,
    recorded_at: Instant,
}

/// The per-COID chain: an optional materialized snapshot plus every logged
/// mutation applied since.
struct Chain {
    entries: Vec<LogEntry>,
    snapshot: Option<(Version, Option<Value>)>,
    adds: u32,
    delranges: u32,
}

impl Chain {
    fn new() -> Self {
        Chain { entries: Vec::new(), snapshot: None, adds: 0, delranges: 0 }
    }

    fn needs_checkpoint(&self, cfg: &Config) -> bool {
        self.entries.len() as u32 >= cfg.checkpoint_min_items
            || self.adds >= cfg.checkpoint_min_adds
            || self.delranges >= cfg.checkpoint_min_delranges
    }

    /// Folds the snapshot (if any) and every logged entry into a single
    /// materialized value at the chain's latest version, then trims the
    /// chain. After this, reads at a version older than the new snapshot's
    /// version are no longer reconstructible (see `CoidCache::read`).
    fn checkpoint(&mut self) -> CResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let mut value = self.snapshot.take().and_then(|(_, v)| v);
        let mut last_version = self.snapshot_version();
        for entry in &self.entries {
            value = apply_op(value, &entry.op)?;
            last_version = entry.version;
        }
        self.snapshot = Some((last_version, value));
        self.entries.clear();
        self.adds = 0;
        self.delranges = 0;
        Ok(())
    }

    fn snapshot_version(&self) -> Version {
        self.snapshot.as_ref().map(|(v, _)| *v).unwrap_or(0)
    }

    fn latest_version(&self) -> Version {
        self.entries.last().map(|e| e.version).unwrap_or_else(|| self.snapshot_version())
    }
}

pub(crate) fn apply_op(current: Option<Value>, op: &LogOp) -> CResult<Option<Value>> {
    match op {
        LogOp::Put(value) => Ok(Some(value.clone())),
        LogOp::Delete => Ok(None),
        LogOp::DeleteRange { lo, hi, kind } => {
            let mut value = current.ok_or(Error::WrongType)?;
            let sv = value.as_super()?;
            let mut sv = sv.clone();
            sv.delete_range(*lo, *hi, *kind);
            Ok(Some(Value::Super(sv)))
        }
        LogOp::SetAttr { id, value: attr_value } => {
            let mut value = current.ok_or(Error::WrongType)?;
            let sv = value.as_super()?;
            let mut sv = sv.clone();
            sv.set_attr(*id, *attr_value);
            Ok(Some(Value::Super(sv)))
        }
    }
}

/// The per-server COID cache and log, shared by every connection the server
/// handles. Cheap to `Arc`-clone-share with a background eviction task.
pub struct CoidCache {
    config: Config,
    chains: RwLock<HashMap<Coid, Arc<Mutex<Chain>>>>,
    retention: Duration,
}

impl CoidCache {
    pub fn new(config: Config) -> Self {
        let retention = Duration::from_millis(config.log_retention_ms);
        CoidCache { config, chains: RwLock::new(HashMap::new()), retention }
    }

    fn chain_for(&self, coid: Coid) -> CResult<Arc<Mutex<Chain>>> {
        if let Some(chain) = self.chains.read()?.get(&coid) {
            return Ok(chain.clone());
        }
        let mut chains = self.chains.write()?;
        Ok(chains.entry(coid).or_insert_with(|| Arc::new(Mutex::new(Chain::new()))).clone())
    }

    /// Appends a logged mutation under the COID's per-chain lock.
    /// Opportunistically checkpoints if the chain has grown past threshold.
    pub fn apply(&self, coid: Coid, version: Version, op: LogOp) -> CResult<()> {
        let chain = self.chain_for(coid)?;
        let mut chain = chain.lock()?;
        match &op {
            LogOp::Put(_) => chain.adds += 1,
            LogOp::DeleteRange { .. } => chain.delranges += 1,
            _ => {}
        }
        chain.entries.push(LogEntry { version, op, recorded_at: Instant::now() });
        if chain.needs_checkpoint(&self.config) {
            chain.checkpoint()?;
        }
        Ok(())
    }

    /// Reads the value of `coid` as of `ts`: locates the snapshot (if any)
    /// and replays logged entries up to `ts`. Fails with `StaleRead` if
    /// `ts` predates the snapshot's version, since entries older than the
    /// snapshot have already been folded away and can't be un-replayed.
    pub fn read(&self, coid: Coid, ts: Version) -> CResult<Option<Value>> {
        let chain = self.chain_for(coid)?;
        let mut chain = chain.lock()?;
        if chain.needs_checkpoint(&self.config) {
            chain.checkpoint()?;
        }
        let floor = chain.snapshot_version();
        if ts < floor {
            return Err(Error::TransactionAbort(AbortReason::StaleRead));
        }
        let mut value = chain.snapshot.as_ref().and_then(|(_, v)| v.clone());
        for entry in &chain.entries {
            if entry.version > ts {
                break;
            }
            value = apply_op(value, &entry.op)?;
        }
        Ok(value)
    }

    /// The highest version this COID has been written at, or 0 if it has
    /// never been written. Used by the commit protocol's conflict checks.
    pub fn current_version(&self, coid: Coid) -> CResult<Version> {
        let chain = self.chain_for(coid)?;
        let chain = chain.lock()?;
        Ok(chain.latest_version())
    }

    /// The highest logged version at or before `ts` (the version a read at
    /// `ts` actually observes). Used to populate a transaction's read-set.
    pub fn version_as_of(&self, coid: Coid, ts: Version) -> CResult<Version> {
        let chain = self.chain_for(coid)?;
        let chain = chain.lock()?;
        let mut version = chain.snapshot_version();
        for entry in &chain.entries {
            if entry.version > ts {
                break;
            }
            version = entry.version;
        }
        Ok(version)
    }

    /// Drops log entries older than the configured retention window by
    /// folding them into each COID's snapshot. Safe to call repeatedly
    /// (idempotent: a chain with nothing stale does nothing).
    pub fn evict_expired(&self) -> CResult<usize> {
        let now = Instant::now();
        let chains = self.chains.read()?;
        let mut evicted = 0;
        for chain in chains.values() {
            let mut chain = chain.lock()?;
            if chain.entries.iter().any(|e| now.duration_since(e.recorded_at) >= self.retention) {
                evicted += chain.entries.len();
                chain.checkpoint()?;
            }
        }
        Ok(evicted)
    }

    pub fn len(&self) -> CResult<usize> {
        Ok(self.chains.read()?.len())
    }
}

/// Background thread that periodically evicts expired log entries.
/// Join-able and idempotent: dropping or calling [`EvictionTask::stop`]
/// more than once is harmless.
pub struct EvictionTask {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EvictionTask {
    pub fn spawn(cache: Arc<CoidCache>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_loop = stop.clone();
        let handle = thread::spawn(move || {
            while !stop_loop.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if stop_loop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = cache.evict_expired() {
                    log::error!("coid cache eviction failed: {err}");
                }
            }
        });
        EvictionTask { stop, handle: Some(handle) }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EvictionTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::Blob;

    fn coid() -> Coid {
        Coid::new(1, 1)
    }

    fn cache_with(cfg_mutate: impl FnOnce(&mut Config)) -> CoidCache {
        let mut cfg = Config::default();
        cfg_mutate(&mut cfg);
        CoidCache::new(cfg)
    }

    #[test]
    fn read_before_any_write_is_none() {
        let cache = cache_with(|_| {});
        assert_eq!(cache.read(coid(), 100).unwrap(), None);
    }

    #[test]
    fn apply_then_read_returns_latest_put() {
        let cache = cache_with(|_| {});
        cache.apply(coid(), 1, LogOp::Put(Value::Blob(Blob::new(vec![1])))).unwrap();
        cache.apply(coid(), 2, LogOp::Put(Value::Blob(Blob::new(vec![2])))).unwrap();
        assert_eq!(cache.read(coid(), 2).unwrap().unwrap().as_blob().unwrap().as_slice(), &[2]);
        assert_eq!(cache.read(coid(), 1).unwrap().unwrap().as_blob().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn delete_then_read_is_none() {
        let cache = cache_with(|_| {});
        cache.apply(coid(), 1, LogOp::Put(Value::Blob(Blob::new(vec![1])))).unwrap();
        cache.apply(coid(), 2, LogOp::Delete).unwrap();
        assert_eq!(cache.read(coid(), 2).unwrap(), None);
    }

    #[test]
    fn checkpoint_triggers_past_item_threshold() {
        let cache = cache_with(|c| c.checkpoint_min_items = 2);
        cache.apply(coid(), 1, LogOp::Put(Value::Blob(Blob::new(vec![1])))).unwrap();
        cache.apply(coid(), 2, LogOp::Put(Value::Blob(Blob::new(vec![2])))).unwrap();
        assert_eq!(cache.current_version(coid()).unwrap(), 2);
        // Reading before the folded snapshot's version is now stale.
        let err = cache.read(coid(), 0).unwrap_err();
        assert!(matches!(err, Error::TransactionAbort(AbortReason::StaleRead)));
    }

    #[test]
    fn eviction_folds_aged_entries_into_snapshot() {
        let cache = cache_with(|c| c.log_retention_ms = 0);
        cache.apply(coid(), 1, LogOp::Put(Value::Blob(Blob::new(vec![1])))).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let evicted = cache.evict_expired().unwrap();
        assert_eq!(evicted, 1);
        assert!(cache.read(coid(), 0).is_err());
        assert_eq!(cache.read(coid(), 1).unwrap().unwrap().as_blob().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn delete_range_and_set_attr_fold_into_super_value() {
        let cache = cache_with(|_| {});
        let mut sv = crate::value::SuperValue::new(crate::value::KeyInfo::numeric_ascending());
        sv.insert_cell(crate::value::Cell::leaf(1, vec![]));
        sv.insert_cell(crate::value::Cell::leaf(5, vec![]));
        cache.apply(coid(), 1, LogOp::Put(Value::Super(sv))).unwrap();
        cache.apply(coid(), 2, LogOp::DeleteRange { lo: 0, hi: 3, kind: IntervalKind::ClosedOpen }).unwrap();
        cache.apply(coid(), 3, LogOp::SetAttr { id: 7, value: 42 }).unwrap();
        let value = cache.read(coid(), 3).unwrap().unwrap();
        let sv = value.as_super().unwrap();
        assert_eq!(sv.len(), 1);
        assert_eq!(sv.attr(7), Some(42));
    }

    #[test]
    fn eviction_task_stops_idempotently() {
        let cache = Arc::new(cache_with(|_| {}));
        let mut task = EvictionTask::spawn(cache, Duration::from_millis(1));
        task.stop();
        task.stop();
    }
}
