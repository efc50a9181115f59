use std::collections::HashSet;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use serde_derive::{Deserialize, Serialize};
use crate::error::{CResult, Error};
use crate::mvcc::mvcc::{Key, KeyPrefix};
use crate::mvcc::scan::{Scan, ScanIterator};
use crate::mvcc::Version;
use crate::storage::engine::Engine;

/// The kind of commit protocol a transaction is running, per §6's
/// `one-phase-commit`/`occ`/`non-commutative` config switches. Plain
/// in-memory MVCC transactions run `InMemory`; transactions coordinated by
/// the distributed commit protocol in [`crate::server`] are `Remote` and
/// carry the coordinator's work list alongside the local read/write sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    InMemory,
    Remote,
}

/// An MVCC transaction.
pub struct Transaction<E: Engine> {
    /// The underlying engine, shared by all transactions.
    engine: Arc<Mutex<E>>,

    /// The transaction state.
    st: TransactionState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionState {
    /// The version this transaction is running at.
    /// Only one read-write transaction can run at a given version, since this identifies its writes.
    pub version: Version,

    /// If true, the transaction is read only.
    pub read_only: bool,

    /// The set of concurrent active (uncommitted) transactions, as of the start of this transaction.
    /// Their writes should be invisible to this transaction even if they're writing at a lower version,
    /// since they're not committed yet.
    pub active: HashSet<Version>,

    /// Keys read by this transaction so far, used by OCC-style validation
    /// (§6 `occ`) to detect whether a concurrently committed write touched
    /// anything this transaction depended on.
    pub read_set: HashSet<Vec<u8>>,

    /// Keys written by this transaction so far, mirrored from the
    /// `TxnWrite` rollback records for quick in-memory conflict checks.
    pub write_set: HashSet<Vec<u8>>,

    /// COIDs (or server addresses) this transaction still needs to contact
    /// to finish a two-phase commit, populated as work items accumulate.
    /// Empty for purely local/in-memory transactions.
    pub work_list: Vec<crate::coid::Coid>,

    /// Whether this transaction is local to one engine or coordinated
    /// across the distributed commit protocol.
    pub mode: TxMode,
}

impl TransactionState {
    /// Checks whether the version is visible to this transaction.
    ///
    /// Future versions, or versions belonging to active transactions as of
    /// the start of this transaction, are never isible.
    ///
    /// Read-write transactions see their own writes at their version.
    ///
    /// Read-only queries only see versions below the transaction's version,
    /// excluding the version itself. This is to ensure time-travel queries
    /// see a consistent version both before and after the time-travelled
    /// transaction's own write.
    pub fn is_visible(&self, version: Version) -> bool {
        if self.active.contains(&version) {
            false
        } else if self.read_only {
            version < self.version
        } else {
            version <= self.version
        }
    }
}

pub(crate) trait TransactionDef<E: Engine> {
    fn begin(engine: Arc<Mutex<E>>) -> CResult<Transaction<E>>;

    fn begin_read_only(engine: Arc<Mutex<E>>, as_of: Option<Version>) -> CResult<Transaction<E>>;

    fn resume(engine: Arc<Mutex<E>>, state: TransactionState) -> CResult<Transaction<E>>;

    fn commit(self) -> CResult<()>;

    fn rollback(self) -> CResult<()>;

    fn delete(&mut self, key: &[u8]) -> CResult<()>;

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()>;
}

impl<E: Engine> Transaction<E> {
    pub fn version(&self) -> Version {
        self.st.version
    }

    pub fn read_only(&self) -> bool {
        self.st.read_only
    }

    pub fn state(&self) -> &TransactionState {
        &self.st
    }

    /// Fetches the next available version from storage, and increments it
    /// for the next caller.
    fn next_version(engine: &mut E) -> CResult<Version> {
        let version = match engine.get(&Key::NextVersion.encode()?)? {
            Some(ref v) => bincode::deserialize(v)?,
            None => 1,
        };
        engine.set(&Key::NextVersion.encode()?, bincode::serialize(&(version + 1))?)?;
        Ok(version)
    }

    /// Scans the set of currently active transactions.
    fn scan_active(engine: &mut E) -> CResult<HashSet<Version>> {
        let mut active = HashSet::new();
        let mut scan = engine.scan_prefix(&KeyPrefix::TxnActive.encode()?);
        while let Some((key, _)) = scan.next().transpose()? {
            match Key::decode(&key)? {
                Key::TxnActive(version) => {
                    active.insert(version);
                }
                key => return Err(Error::Internal(format!("expected TxnActive key, got {key:?}"))),
            }
        }
        Ok(active)
    }

    /// Writes a value for a key. None is used for deletion.
    fn write(&mut self, key: &[u8], value: Option<Vec<u8>>) -> CResult<()> {
        if self.st.read_only {
            return Err(Error::Internal("cannot write in a read-only transaction".into()));
        }
        let mut engine = self.engine.lock()?;

        // Check for write conflicts: any visible version at or above our own,
        // or any version belonging to a transaction still in our active set,
        // aborts us with a retriable conflict.
        let from = Key::Version(
            key.into(),
            self.st.active.iter().min().copied().unwrap_or(self.st.version + 1),
        )
        .encode()?;
        let to = Key::Version(key.into(), u64::MAX).encode()?;
        if let Some((k, _)) = engine.scan(from..=to).next_back().transpose()? {
            match Key::decode(&k)? {
                Key::Version(_, version) => {
                    if !self.st.is_visible(version) {
                        return Err(Error::TransactionAbort(crate::error::AbortReason::Conflict));
                    }
                }
                k => return Err(Error::Internal(format!("expected Version key, got {k:?}"))),
            }
        }

        // Write the new version, and record it in the transaction's write log.
        engine.set(&Key::TxnWrite(self.st.version, key.into()).encode()?, vec![])?;
        engine.set(&Key::Version(key.into(), self.st.version).encode()?, bincode::serialize(&value)?)?;
        drop(engine);

        self.st.write_set.insert(key.to_vec());
        Ok(())
    }

    /// Returns an iterator over the latest visible key/value pairs in the
    /// given user-key range. The range is translated into a scan over
    /// `Key::Version(key, version)` entries: the lower/upper bound on the
    /// user key is widened to cover every version of the boundary key, so
    /// that visibility filtering in [`ScanIterator`] sees every candidate
    /// version and picks the latest visible one.
    pub fn scan(&self, range: impl std::ops::RangeBounds<Vec<u8>>) -> CResult<ScanIterator<'_, E>> {
        let start = match range.start_bound() {
            Bound::Excluded(k) => Bound::Excluded(Key::Version(k.clone().into(), u64::MAX).encode()?),
            Bound::Included(k) => Bound::Included(Key::Version(k.clone().into(), 0).encode()?),
            Bound::Unbounded => Bound::Included(Key::Version(Vec::new().into(), 0).encode()?),
        };
        let end = match range.end_bound() {
            Bound::Excluded(k) => Bound::Excluded(Key::Version(k.clone().into(), 0).encode()?),
            Bound::Included(k) => Bound::Included(Key::Version(k.clone().into(), u64::MAX).encode()?),
            Bound::Unbounded => Bound::Unbounded,
        };
        Ok(Scan::new(self.engine.lock()?, &self.st, start, end).into_iter())
    }

    /// Returns an iterator over the latest visible key/value pairs starting
    /// with prefix.
    pub fn scan_prefix(&self, prefix: &[u8]) -> CResult<ScanIterator<'_, E>> {
        Ok(Scan::new_prefix(self.engine.lock()?, &self.st, prefix.to_vec()).into_iter())
    }
}

impl<E: Engine> TransactionDef<E> for Transaction<E> {
    /// Begins a new read-write transaction.
    fn begin(engine: Arc<Mutex<E>>) -> CResult<Transaction<E>> {
        let mut session = engine.lock()?;

        let version = Self::next_version(&mut session)?;
        let active = Self::scan_active(&mut session)?;

        // Save the transaction, for rollback purposes.
        if !active.is_empty() {
            session.set(&Key::TxnActiveSnapshot(version).encode()?, bincode::serialize(&active)?)?;
        }

        session.set(&Key::TxnActive(version).encode()?, vec![])?;
        drop(session);

        Ok(Self {
            engine,
            st: TransactionState {
                version,
                read_only: false,
                active,
                read_set: HashSet::new(),
                write_set: HashSet::new(),
                work_list: Vec::new(),
                mode: TxMode::InMemory,
            },
        })
    }

    /// Begins a new read-only transaction.
    ///
    /// If `as_of` is given, the transaction is at that as of that version,
    /// as if it had started then. It must be at or before the current
    /// `NextVersion`. Since this is not tracked as an active transaction,
    /// its corresponding version must have been committed, and no older
    /// active transaction may exist at that version, otherwise the time
    /// travel query could see past-partial commits.
    fn begin_read_only(engine: Arc<Mutex<E>>, as_of: Option<Version>) -> CResult<Transaction<E>> {
        let mut session = engine.lock()?;

        let mut version = match session.get(&Key::NextVersion.encode()?)? {
            Some(ref v) => bincode::deserialize(v)?,
            None => 1,
        };
        let mut active = HashSet::new();
        if let Some(as_of) = as_of {
            if as_of >= version {
                return Err(Error::Value(format!("version {as_of} does not exist")));
            }
            version = as_of;
            if let Some(value) = session.get(&Key::TxnActiveSnapshot(version).encode()?)? {
                active = bincode::deserialize(&value)?;
            }
        } else {
            active = Self::scan_active(&mut session)?;
        }
        drop(session);

        Ok(Self {
            engine,
            st: TransactionState {
                version,
                read_only: true,
                active,
                read_set: HashSet::new(),
                write_set: HashSet::new(),
                work_list: Vec::new(),
                mode: TxMode::InMemory,
            },
        })
    }

    /// Resumes a transaction from the given state.
    fn resume(engine: Arc<Mutex<E>>, state: TransactionState) -> CResult<Transaction<E>> {
        // For read-write transactions, verify that the transaction is still
        // active before making further writes.
        if !state.read_only {
            let mut session = engine.lock()?;
            if session.get(&Key::TxnActive(state.version).encode()?)?.is_none() {
                return Err(Error::Internal(format!("no active transaction at version {}", state.version)));
            }
        }
        Ok(Self { engine, st: state })
    }

    /// Commits the transaction, by removing it from the active set. This
    /// will immediately make its writes visible to subsequent
    /// transactions. Also removes its TxnWrite records, which are no
    /// longer needed.
    fn commit(self) -> CResult<()> {
        if self.st.read_only {
            return Ok(());
        }
        let mut engine = self.engine.lock()?;
        let remove = engine
            .scan_prefix(&KeyPrefix::TxnWrite(self.st.version).encode()?)
            .map(|r| r.map(|(k, _)| k))
            .collect::<CResult<Vec<_>>>()?;
        for key in remove {
            engine.delete(&key)?;
        }
        engine.delete(&Key::TxnActive(self.st.version).encode()?)?;
        Ok(())
    }

    /// Rolls back the transaction, by undoing all written versions and
    /// removing it from the active set.
    fn rollback(self) -> CResult<()> {
        if self.st.read_only {
            return Ok(());
        }
        let mut engine = self.engine.lock()?;
        let mut rollback = Vec::new();
        let mut scan = engine.scan_prefix(&KeyPrefix::TxnWrite(self.st.version).encode()?);
        while let Some((key, _)) = scan.next().transpose()? {
            match Key::decode(&key)? {
                Key::TxnWrite(_, key) => rollback.push(Key::Version(key, self.st.version).encode()?),
                key => return Err(Error::Internal(format!("expected TxnWrite key, got {key:?}"))),
            }
            rollback.push(key);
        }
        drop(scan);
        for key in rollback {
            engine.delete(&key)?;
        }
        engine.delete(&Key::TxnActive(self.st.version).encode()?)?;
        Ok(())
    }

    /// Deletes a key.
    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.write(key, None)
    }

    /// Fetches a key's value, or None if it does not exist.
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let mut engine = self.engine.lock()?;
        let from = Key::Version(key.into(), 0).encode()?;
        let to = Key::Version(key.into(), self.st.version).encode()?;
        let mut scan = engine.scan(from..=to).rev();
        while let Some((k, v)) = scan.next().transpose()? {
            match Key::decode(&k)? {
                Key::Version(_, version) => {
                    if self.st.is_visible(version) {
                        return Ok(bincode::deserialize(&v)?);
                    }
                }
                k => return Err(Error::Internal(format!("expected Version key, got {k:?}"))),
            }
        }
        Ok(None)
    }

    /// Sets a value for a key.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.write(key, Some(value))
    }
}

#[cfg(test)]
#[path = "transaction_test.rs"]
mod transaction_test;

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::Memory;

    fn engine() -> Arc<Mutex<Memory>> {
        Arc::new(Mutex::new(Memory::new()))
    }

    #[test]
    fn set_then_get_sees_own_write() {
        let e = engine();
        let mut tx = Transaction::begin(e).unwrap();
        tx.set(b"a", vec![1]).unwrap();
        assert_eq!(tx.get(b"a").unwrap(), Some(vec![1]));
    }

    #[test]
    fn uncommitted_write_is_invisible_to_other_transaction() {
        let e = engine();
        let mut t1 = Transaction::begin(e.clone()).unwrap();
        t1.set(b"a", vec![1]).unwrap();
        let mut t2 = Transaction::begin(e).unwrap();
        assert_eq!(t2.get(b"a").unwrap(), None);
    }

    #[test]
    fn committed_write_is_visible_to_later_transaction() {
        let e = engine();
        let mut t1 = Transaction::begin(e.clone()).unwrap();
        t1.set(b"a", vec![1]).unwrap();
        t1.commit().unwrap();
        let mut t2 = Transaction::begin(e).unwrap();
        assert_eq!(t2.get(b"a").unwrap(), Some(vec![1]));
    }

    #[test]
    fn rollback_undoes_writes() {
        let e = engine();
        let mut t1 = Transaction::begin(e.clone()).unwrap();
        t1.set(b"a", vec![1]).unwrap();
        t1.rollback().unwrap();
        let mut t2 = Transaction::begin(e).unwrap();
        assert_eq!(t2.get(b"a").unwrap(), None);
    }

    #[test]
    fn concurrent_write_to_same_key_conflicts() {
        let e = engine();
        let mut t1 = Transaction::begin(e.clone()).unwrap();
        let mut t2 = Transaction::begin(e).unwrap();
        t1.set(b"a", vec![1]).unwrap();
        t1.commit().unwrap();
        let err = t2.set(b"a", vec![2]).unwrap_err();
        assert!(matches!(err, Error::TransactionAbort(_)));
    }

    #[test]
    fn delete_then_get_is_none() {
        let e = engine();
        let mut t1 = Transaction::begin(e.clone()).unwrap();
        t1.set(b"a", vec![1]).unwrap();
        t1.commit().unwrap();
        let mut t2 = Transaction::begin(e).unwrap();
        t2.delete(b"a").unwrap();
        assert_eq!(t2.get(b"a").unwrap(), None);
        t2.commit().unwrap();
    }

    #[test]
    fn read_only_transaction_rejects_writes() {
        let e = engine();
        let mut tx = Transaction::begin_read_only(e, None).unwrap();
        assert!(tx.set(b"a", vec![1]).is_err());
    }

    #[test]
    fn scan_returns_latest_visible_versions_in_key_order() {
        let e = engine();
        let mut t1 = Transaction::begin(e.clone()).unwrap();
        t1.set(b"a", vec![1]).unwrap();
        t1.set(b"b", vec![2]).unwrap();
        t1.commit().unwrap();
        let t2 = Transaction::begin(e).unwrap();
        let rows: Vec<(Vec<u8>, Vec<u8>)> = t2.scan(..).unwrap().collect::<CResult<Vec<_>>>().unwrap();
        assert_eq!(rows, vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2])]);
    }

    #[test]
    fn resume_reconstructs_an_equivalent_transaction() {
        let e = engine();
        let mut t1 = Transaction::begin(e.clone()).unwrap();
        t1.set(b"a", vec![1]).unwrap();
        let state = t1.state().clone();
        let mut resumed = Transaction::resume(e, state).unwrap();
        assert_eq!(resumed.get(b"a").unwrap(), Some(vec![1]));
        resumed.commit().unwrap();
    }
}
