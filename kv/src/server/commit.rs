//! The KV transaction runtime (§4.3): two-phase commit with a one-phase
//! fast path, OCC validation, non-commutative writes, and the delete-range
//! conflict policy. Grounded in `kvinterface.h`'s `KVTransaction`
//! (work list, readonly flag, begin/commit/abort/free/sub-transaction
//! verbs) and the source's `beginTx`/`commitTx`/`abortTx`/`beginSubTx`
//! family.
//!
//! This repo has a single in-process `ServerState` rather than a cluster of
//! independent server processes, so the wire-level prepare/commit round
//! trip of §4.3 collapses to direct method calls; `config.one_phase_commit`
//! still has observable effect, gating whether callers may use the fused
//! single-call [`ServerState::commit_transaction`] or must go through the
//! explicit two-step [`ServerState::prepare`]/[`ServerState::finalize`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::coid::Coid;
use crate::config::Config;
use crate::error::{AbortReason, CResult, Error};
use crate::mvcc::Version;
use crate::server::cache::{CoidCache, LogOp};
use crate::value::{Blob, Cell, IntervalKind, KeyInfo, SuperValue, Value};

/// Mirrors §4.8's KV transaction state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Active,
    Preparing,
    Committed,
    Aborted,
    Freed,
}

/// A client-side transaction handle: read/write sets plus a savepoint
/// stack for sub-transactions. Mirrors `KVTransaction`'s `work`/`readonly`
/// fields, generalized to the runtime's read-set and write-set.
pub struct KvTransaction {
    pub id: u64,
    pub snapshot: Version,
    read_only: bool,
    reads: HashMap<Coid, Version>,
    writes: Vec<(Coid, LogOp)>,
    savepoints: Vec<usize>,
    pub work_list: Vec<Coid>,
    state: TxState,
}

impl KvTransaction {
    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn tx_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    fn require_writable(&self) -> CResult<()> {
        if self.state != TxState::Active {
            return Err(Error::Internal("transaction is not active".into()));
        }
        if self.read_only {
            return Err(Error::Internal("cannot write in a read-only transaction".into()));
        }
        Ok(())
    }

    fn record_read(&mut self, coid: Coid, version: Version) {
        self.reads.entry(coid).or_insert(version);
    }

    /// Read-your-writes value for `coid`: the committed base at this
    /// transaction's snapshot, with every local (uncommitted) write to this
    /// COID replayed on top.
    fn local_value(&mut self, cache: &CoidCache, coid: Coid) -> CResult<Option<Value>> {
        let has_local_writes = self.writes.iter().any(|(c, _)| *c == coid);
        if !has_local_writes {
            let version = cache.version_as_of(coid, self.snapshot)?;
            self.record_read(coid, version);
        }
        let mut value = cache.read(coid, self.snapshot)?;
        for (c, op) in &self.writes {
            if *c == coid {
                value = crate::server::cache::apply_op(value, op)?;
            }
        }
        Ok(value)
    }

    pub fn get(&mut self, cache: &CoidCache, coid: Coid) -> CResult<Option<Value>> {
        if self.state != TxState::Active {
            return Err(Error::Internal("transaction is not active".into()));
        }
        self.local_value(cache, coid)
    }

    /// Like `get`, but pads the returned buffer with `pad` extra
    /// (unspecified-content) bytes for in-place growth, mirroring
    /// `memKVgetPad`/`KVget`'s padded variant.
    pub fn get_padded(&mut self, cache: &CoidCache, coid: Coid, pad: usize) -> CResult<Option<Vec<u8>>> {
        match self.get(cache, coid)? {
            Some(value) => {
                let mut buf = value.as_blob()?.as_slice().to_vec();
                buf.resize(buf.len() + pad, 0);
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    pub fn put(&mut self, coid: Coid, data: Vec<u8>) -> CResult<()> {
        self.require_writable()?;
        self.writes.push((coid, LogOp::Put(Value::Blob(Blob::new(data)))));
        Ok(())
    }

    pub fn put2(&mut self, coid: Coid, data1: Vec<u8>, data2: &[u8]) -> CResult<()> {
        let mut buf = data1;
        buf.extend_from_slice(data2);
        self.put(coid, buf)
    }

    pub fn put3(&mut self, coid: Coid, data1: Vec<u8>, data2: &[u8], data3: &[u8]) -> CResult<()> {
        let mut buf = data1;
        buf.extend_from_slice(data2);
        buf.extend_from_slice(data3);
        self.put(coid, buf)
    }

    pub fn delete(&mut self, coid: Coid) -> CResult<()> {
        self.require_writable()?;
        self.writes.push((coid, LogOp::Delete));
        Ok(())
    }

    pub fn read_super(&mut self, cache: &CoidCache, coid: Coid) -> CResult<Option<SuperValue>> {
        match self.get(cache, coid)? {
            Some(value) => Ok(Some(value.as_super()?.clone())),
            None => Ok(None),
        }
    }

    pub fn write_super(&mut self, coid: Coid, sv: SuperValue) -> CResult<()> {
        self.require_writable()?;
        self.writes.push((coid, LogOp::Put(Value::Super(sv))));
        Ok(())
    }

    /// Adds a cell to the super-value at `coid` (creating an empty one if
    /// absent), returning the resulting `(cell_count, byte_size)` hint the
    /// B-tree layer uses to decide whether to request a split.
    pub fn list_add(&mut self, cache: &CoidCache, coid: Coid, cell: Cell) -> CResult<(u32, u32)> {
        self.require_writable()?;
        let mut sv =
            self.read_super(cache, coid)?.unwrap_or_else(|| SuperValue::new(KeyInfo::numeric_ascending()));
        sv.insert_cell(cell);
        let count = sv.len() as u32;
        let size: u32 = sv.cells().iter().map(|c| (c.payload.len() + 16) as u32).sum();
        self.writes.push((coid, LogOp::Put(Value::Super(sv))));
        Ok((count, size))
    }

    pub fn list_del_range(&mut self, coid: Coid, lo: i64, hi: i64, kind: IntervalKind) -> CResult<()> {
        self.require_writable()?;
        self.writes.push((coid, LogOp::DeleteRange { lo, hi, kind }));
        Ok(())
    }

    pub fn attr_set(&mut self, coid: Coid, id: u32, value: u64) -> CResult<()> {
        self.require_writable()?;
        self.writes.push((coid, LogOp::SetAttr { id, value }));
        Ok(())
    }

    /// Starts a sub-transaction (savepoint) at `level`, which must be one
    /// past the current nesting depth.
    pub fn begin_sub(&mut self, level: usize) -> CResult<()> {
        if level != self.savepoints.len() + 1 {
            return Err(Error::Internal(format!("sub-transaction level {level} out of sequence")));
        }
        self.savepoints.push(self.writes.len());
        Ok(())
    }

    /// Rolls back to the savepoint at `level`, discarding every write made
    /// since and any deeper, already-released savepoints.
    pub fn abort_sub(&mut self, level: usize) -> CResult<()> {
        if level == 0 || level > self.savepoints.len() {
            return Err(Error::Internal(format!("no sub-transaction at level {level}")));
        }
        let mark = self.savepoints[level - 1];
        self.savepoints.truncate(level - 1);
        self.writes.truncate(mark);
        Ok(())
    }

    /// Releases the savepoint at `level` without discarding its writes,
    /// folding them into the parent (sub-)transaction.
    pub fn release_sub(&mut self, level: usize) -> CResult<()> {
        if level == 0 || level > self.savepoints.len() {
            return Err(Error::Internal(format!("no sub-transaction at level {level}")));
        }
        self.savepoints.truncate(level - 1);
        Ok(())
    }
}

/// A participant's vote on a PREPARE, per §4.3's commit phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareVote {
    Prepared { commit_ts: Version },
    Abort(AbortReason),
}

/// Result of a successful commit: the timestamp it was installed at, and
/// any COIDs whose super-value just crossed the split thresholds.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitOutcome {
    pub commit_ts: Version,
    pub work_list: Vec<Coid>,
}

/// Per-process server state: the COID cache/log, the commit-timestamp and
/// transaction-id clocks, the non-commutative/delete-range prepare-lock
/// table, and the row-id allocator backing `ALLOC-ROWID`.
pub struct ServerState {
    pub config: Config,
    pub cache: std::sync::Arc<CoidCache>,
    next_version: AtomicU64,
    next_tx_id: AtomicU64,
    locks: Mutex<HashMap<Coid, u64>>,
    rowid_counters: Mutex<HashMap<u64, u64>>,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        ServerState {
            cache: std::sync::Arc::new(CoidCache::new(config.clone())),
            config,
            next_version: AtomicU64::new(1),
            next_tx_id: AtomicU64::new(1),
            locks: Mutex::new(HashMap::new()),
            rowid_counters: Mutex::new(HashMap::new()),
        }
    }

    fn next_commit_ts(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn begin_transaction(&self, read_only: bool) -> KvTransaction {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.next_commit_ts();
        KvTransaction {
            id,
            snapshot,
            read_only,
            reads: HashMap::new(),
            writes: Vec::new(),
            savepoints: Vec::new(),
            work_list: Vec::new(),
            state: TxState::Active,
        }
    }

    /// Allocates a fresh row id for `cid`, starting at `hint` the first
    /// time it's requested for that container.
    pub fn alloc_rowid(&self, cid: u64, hint: u64) -> CResult<u64> {
        let mut counters = self.rowid_counters.lock()?;
        let counter = counters.entry(cid).or_insert_with(|| hint.max(1));
        let rowid = *counter;
        *counter += 1;
        Ok(rowid)
    }

    /// A write needs the non-commutative/delete-range prepare lock if
    /// either `non_commutative` is set (every write conflicts with every
    /// other write to the same COID) or it's a delete-range and
    /// `delrange_conflict_delrange` is set (delete-ranges conflict with
    /// each other even when commutative writes are otherwise allowed).
    fn needs_lock(&self, op: &LogOp) -> bool {
        self.config.non_commutative || (matches!(op, LogOp::DeleteRange { .. }) && self.config.delrange_conflict_delrange)
    }

    fn acquire_locks(&self, tx: &KvTransaction) -> CResult<()> {
        let mut locks = self.locks.lock()?;
        for (coid, op) in &tx.writes {
            if self.needs_lock(op) {
                if let Some(&holder) = locks.get(coid) {
                    if holder != tx.id {
                        return Err(Error::TransactionAbort(AbortReason::PrepareReject));
                    }
                }
            }
        }
        for (coid, op) in &tx.writes {
            if self.needs_lock(op) {
                locks.insert(*coid, tx.id);
            }
        }
        Ok(())
    }

    fn release_locks(&self, tx: &KvTransaction) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.retain(|_, holder| *holder != tx.id);
        }
    }

    /// Checks that nothing in `tx`'s read-set was overwritten since it was
    /// read. In OCC mode, any version bump is a conflict; otherwise a
    /// version bump is tolerated if the value it produced happens to be
    /// unchanged (a commutative, conflict-free write).
    fn check_conflicts(&self, tx: &KvTransaction) -> CResult<()> {
        for (&coid, &read_version) in &tx.reads {
            let current = self.cache.current_version(coid)?;
            if current > read_version {
                if self.config.occ {
                    return Err(Error::TransactionAbort(AbortReason::Conflict));
                }
                let before = self.cache.read(coid, read_version)?;
                let after = self.cache.read(coid, current)?;
                if before != after {
                    return Err(Error::TransactionAbort(AbortReason::Conflict));
                }
            }
        }
        Ok(())
    }

    /// Phase 1 of §4.3's commit: validates the read-set and acquires any
    /// prepare locks the write-set needs, returning a commit timestamp on
    /// success.
    pub fn prepare(&self, tx: &mut KvTransaction) -> CResult<PrepareVote> {
        tx.state = TxState::Preparing;
        if let Err(err) = self.check_conflicts(tx) {
            tx.state = TxState::Aborted;
            return Ok(PrepareVote::Abort(abort_reason_of(&err)));
        }
        if let Err(err) = self.acquire_locks(tx) {
            tx.state = TxState::Aborted;
            return Ok(PrepareVote::Abort(abort_reason_of(&err)));
        }
        Ok(PrepareVote::Prepared { commit_ts: self.next_commit_ts() })
    }

    /// Phase 2: installs every write at `commit_ts` and releases prepare
    /// locks. Only valid after a successful `prepare`.
    ///
    /// A transaction's write-set can touch the same coid more than once
    /// (each `put`/`write_super`/`list_add`/`list_del_range`/`attr_set` call
    /// appends its own entry to `tx.writes`); only the last op per coid is
    /// applied, since it already reflects every earlier one (see
    /// `local_value`'s fold). This keeps the log for any one coid to
    /// exactly one entry per commit timestamp.
    pub fn finalize(&self, mut tx: KvTransaction, commit_ts: Version) -> CResult<CommitOutcome> {
        let mut last_write_at = HashMap::new();
        for (i, (coid, _)) in tx.writes.iter().enumerate() {
            last_write_at.insert(*coid, i);
        }

        let mut work_list = Vec::new();
        for (i, (coid, op)) in tx.writes.iter().enumerate() {
            if last_write_at[coid] != i {
                continue;
            }
            self.cache.apply(*coid, commit_ts, op.clone())?;
            if let Some((cells, bytes)) = split_hint(op) {
                if cells >= self.config.split_cells || bytes >= self.config.split_bytes {
                    work_list.push(*coid);
                }
            }
        }
        self.release_locks(&tx);
        tx.state = TxState::Committed;
        tx.work_list = work_list.clone();
        Ok(CommitOutcome { commit_ts, work_list })
    }

    /// The fused one-phase-commit path: prepare and finalize in one call.
    /// Only available when `config.one_phase_commit` is set; otherwise
    /// callers must drive `prepare`/`finalize` explicitly (modeling the
    /// config flag's "disables 1PC entirely" effect in this single-process
    /// server).
    pub fn commit_transaction(&self, mut tx: KvTransaction) -> CResult<CommitOutcome> {
        if tx.writes.is_empty() {
            tx.state = TxState::Committed;
            return Ok(CommitOutcome { commit_ts: tx.snapshot, work_list: Vec::new() });
        }
        if !self.config.one_phase_commit {
            return Err(Error::Internal(
                "one-phase commit is disabled; drive prepare()/finalize() explicitly".into(),
            ));
        }
        match self.prepare(&mut tx)? {
            PrepareVote::Abort(reason) => {
                self.release_locks(&tx);
                Err(Error::TransactionAbort(reason))
            }
            PrepareVote::Prepared { commit_ts } => self.finalize(tx, commit_ts),
        }
    }

    /// Releases any prepare locks held by `tx` and marks it aborted.
    pub fn abort_transaction(&self, mut tx: KvTransaction) {
        self.release_locks(&tx);
        tx.state = TxState::Aborted;
    }
}

fn abort_reason_of(err: &Error) -> AbortReason {
    match err {
        Error::TransactionAbort(reason) => reason.clone(),
        _ => AbortReason::PrepareReject,
    }
}

fn split_hint(op: &LogOp) -> Option<(u32, u32)> {
    match op {
        LogOp::Put(Value::Super(sv)) => {
            let bytes: u32 = sv.cells().iter().map(|c| (c.payload.len() + 16) as u32).sum();
            Some((sv.len() as u32, bytes))
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::IntervalKind;

    fn server() -> ServerState {
        ServerState::new(Config::default())
    }

    fn coid() -> Coid {
        Coid::new(1, 1)
    }

    #[test]
    fn put_then_commit_then_read_back() {
        let server = server();
        let mut tx = server.begin_transaction(false);
        tx.put(coid(), vec![1, 2, 3]).unwrap();
        let outcome = server.commit_transaction(tx).unwrap();
        assert!(outcome.work_list.is_empty());

        let mut tx2 = server.begin_transaction(true);
        let value = tx2.get(&server.cache, coid()).unwrap().unwrap();
        assert_eq!(value.as_blob().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn read_only_transaction_rejects_writes() {
        let server = server();
        let mut tx = server.begin_transaction(true);
        assert!(tx.put(coid(), vec![1]).is_err());
    }

    #[test]
    fn occ_mode_conflicts_on_any_version_bump_even_if_value_unchanged() {
        let mut config = Config::default();
        config.occ = true;
        let server = ServerState::new(config);

        let mut writer = server.begin_transaction(false);
        writer.put(coid(), vec![1]).unwrap();
        server.commit_transaction(writer).unwrap();

        let mut reader = server.begin_transaction(false);
        reader.get(&server.cache, coid()).unwrap();

        let mut rewriter = server.begin_transaction(false);
        rewriter.put(coid(), vec![1]).unwrap(); // same bytes, still a new version
        server.commit_transaction(rewriter).unwrap();

        reader.put(coid(), vec![2]).unwrap();
        let err = server.commit_transaction(reader).unwrap_err();
        assert!(matches!(err, Error::TransactionAbort(AbortReason::Conflict)));
    }

    #[test]
    fn default_mode_tolerates_a_rewrite_of_the_same_value() {
        let server = server();

        let mut writer = server.begin_transaction(false);
        writer.put(coid(), vec![1]).unwrap();
        server.commit_transaction(writer).unwrap();

        let mut reader = server.begin_transaction(false);
        reader.get(&server.cache, coid()).unwrap();

        let mut rewriter = server.begin_transaction(false);
        rewriter.put(coid(), vec![1]).unwrap();
        server.commit_transaction(rewriter).unwrap();

        reader.put(Coid::new(1, 2), vec![9]).unwrap();
        assert!(server.commit_transaction(reader).is_ok());
    }

    #[test]
    fn non_commutative_mode_serializes_concurrent_writers_to_the_same_coid() {
        let mut config = Config::default();
        config.non_commutative = true;
        let server = ServerState::new(config);

        let mut a = server.begin_transaction(false);
        a.put(coid(), vec![1]).unwrap();
        let mut b = server.begin_transaction(false);
        b.put(coid(), vec![2]).unwrap();

        server.commit_transaction(a).unwrap();
        let err = server.commit_transaction(b).unwrap_err();
        assert!(matches!(err, Error::TransactionAbort(AbortReason::PrepareReject)));
    }

    #[test]
    fn one_phase_commit_disabled_requires_explicit_prepare_finalize() {
        let mut config = Config::default();
        config.one_phase_commit = false;
        let server = ServerState::new(config);

        let mut tx = server.begin_transaction(false);
        tx.put(coid(), vec![1]).unwrap();
        assert!(server.commit_transaction(tx).is_err());

        let mut tx = server.begin_transaction(false);
        tx.put(coid(), vec![1]).unwrap();
        match server.prepare(&mut tx).unwrap() {
            PrepareVote::Prepared { commit_ts } => {
                server.finalize(tx, commit_ts).unwrap();
            }
            PrepareVote::Abort(_) => panic!("expected prepared"),
        }
    }

    #[test]
    fn list_add_past_split_cells_threshold_enqueues_a_work_item() {
        let mut config = Config::default();
        config.split_cells = 2;
        let server = ServerState::new(config);

        let mut tx = server.begin_transaction(false);
        tx.list_add(&server.cache, coid(), Cell::leaf(1, vec![])).unwrap();
        tx.list_add(&server.cache, coid(), Cell::leaf(2, vec![])).unwrap();
        let outcome = server.commit_transaction(tx).unwrap();
        assert_eq!(outcome.work_list, vec![coid()]);
    }

    #[test]
    fn repeated_writes_to_the_same_coid_in_one_commit_fold_to_a_single_log_entry() {
        let mut config = Config::default();
        config.log_retention_ms = 0;
        let server = ServerState::new(config);

        let mut tx = server.begin_transaction(false);
        tx.list_add(&server.cache, coid(), Cell::leaf(1, vec![1])).unwrap();
        tx.list_add(&server.cache, coid(), Cell::leaf(2, vec![2])).unwrap();
        server.commit_transaction(tx).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let evicted = server.cache.evict_expired().unwrap();
        assert_eq!(evicted, 1, "two writes to one coid in a single commit must log as one entry");
    }

    #[test]
    fn sub_transaction_abort_discards_only_its_own_writes() {
        let server = server();
        let mut tx = server.begin_transaction(false);
        tx.put(Coid::new(1, 1), vec![1]).unwrap();
        tx.begin_sub(1).unwrap();
        tx.put(Coid::new(1, 2), vec![2]).unwrap();
        tx.abort_sub(1).unwrap();
        let outcome = server.commit_transaction(tx).unwrap();
        assert!(outcome.work_list.is_empty());

        let mut reader = server.begin_transaction(true);
        assert!(reader.get(&server.cache, Coid::new(1, 1)).unwrap().is_some());
        assert!(reader.get(&server.cache, Coid::new(1, 2)).unwrap().is_none());
    }

    #[test]
    fn list_del_range_conflicts_by_default_between_concurrent_transactions() {
        let server = server();
        let mut a = server.begin_transaction(false);
        a.write_super(coid(), SuperValue::new(KeyInfo::numeric_ascending())).unwrap();
        server.commit_transaction(a).unwrap();

        let mut a = server.begin_transaction(false);
        a.list_del_range(coid(), 0, 10, IntervalKind::ClosedOpen).unwrap();
        let mut b = server.begin_transaction(false);
        b.list_del_range(coid(), 0, 10, IntervalKind::ClosedOpen).unwrap();

        server.commit_transaction(a).unwrap();
        let err = server.commit_transaction(b).unwrap_err();
        assert!(matches!(err, Error::TransactionAbort(AbortReason::PrepareReject)));
    }

    #[test]
    fn alloc_rowid_increments_from_the_given_hint() {
        let server = server();
        assert_eq!(server.alloc_rowid(1, 100).unwrap(), 100);
        assert_eq!(server.alloc_rowid(1, 100).unwrap(), 101);
        assert_eq!(server.alloc_rowid(2, 5).unwrap(), 5);
    }
}
