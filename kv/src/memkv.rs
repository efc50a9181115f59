//! Ephemeral in-memory key-value backend for temporary, session-local
//! tables (cids with [`crate::coid::EPHEMDB_CID_BIT`] set). Grounded in
//! `memkv-simple.h`: one process-wide table guarded by a single
//! reader-writer lock, with no-op transaction begin/commit/abort since
//! nothing here ever needs to survive a crash or coordinate across
//! processes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::coid::Coid;
use crate::error::CResult;
use crate::value::{Blob, Value};

/// A single in-flight ephemeral transaction. Carries no state of its own:
/// reads and writes against [`MemKv`] take effect immediately, matching
/// `membeginTx`/`memcommitTx`/`memabortTx`'s no-op bodies in the source
/// system (ephemeral tables never conflict with anything but themselves).
#[derive(Debug)]
pub struct MemTransaction {
    aborted: bool,
}

impl MemTransaction {
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

/// The process-wide ephemeral table: coid to value, shared by every
/// [`MemTransaction`]. Cloning a [`MemKv`] shares the same backing table.
#[derive(Clone, Default)]
pub struct MemKv {
    table: Arc<RwLock<HashMap<Coid, Value>>>,
}

impl MemKv {
    pub fn new() -> Self {
        MemKv { table: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Starts a new ephemeral transaction. Never fails: there is no log,
    /// no network round-trip, nothing to allocate.
    pub fn begin(&self) -> MemTransaction {
        MemTransaction { aborted: false }
    }

    pub fn commit(&self, tx: MemTransaction) -> CResult<()> {
        let _ = tx;
        Ok(())
    }

    pub fn abort(&self, mut tx: MemTransaction) {
        tx.abort();
    }

    /// Reads the blob stored at `coid`, or `None` if nothing is stored
    /// there. Mirrors `memKVget`.
    pub fn get(&self, _tx: &MemTransaction, coid: Coid) -> CResult<Option<Blob>> {
        let table = self.table.read()?;
        match table.get(&coid) {
            Some(value) => Ok(Some(value.as_blob()?.clone())),
            None => Ok(None),
        }
    }

    /// Reads the blob at `coid`, zero-padded with `pad` extra trailing
    /// bytes. Mirrors `memKVgetPad`, used by callers that overlay a fixed
    /// binary header on top of a variable-length value.
    pub fn get_padded(&self, tx: &MemTransaction, coid: Coid, pad: usize) -> CResult<Option<Vec<u8>>> {
        Ok(self.get(tx, coid)?.map(|blob| {
            let mut buf = blob.as_slice().to_vec();
            buf.resize(buf.len() + pad, 0);
            buf
        }))
    }

    /// Reads back whatever shape (blob or super-value) is stored at
    /// `coid`, for callers that don't know in advance which they'll find.
    pub fn get_value(&self, _tx: &MemTransaction, coid: Coid) -> CResult<Option<Value>> {
        Ok(self.table.read()?.get(&coid).cloned())
    }

    /// Stores `data` as a plain blob at `coid`. Mirrors `memKVput`.
    pub fn put(&self, _tx: &MemTransaction, coid: Coid, data: Vec<u8>) -> CResult<()> {
        self.table.write()?.insert(coid, Value::Blob(Blob::new(data)));
        Ok(())
    }

    /// Stores the concatenation of `data1` and `data2`. Mirrors `memKVput2`.
    pub fn put2(&self, tx: &MemTransaction, coid: Coid, data1: &[u8], data2: &[u8]) -> CResult<()> {
        let mut buf = Vec::with_capacity(data1.len() + data2.len());
        buf.extend_from_slice(data1);
        buf.extend_from_slice(data2);
        self.put(tx, coid, buf)
    }

    /// Stores the concatenation of three buffers. Mirrors `memKVput3`.
    pub fn put3(&self, tx: &MemTransaction, coid: Coid, data1: &[u8], data2: &[u8], data3: &[u8]) -> CResult<()> {
        let mut buf = Vec::with_capacity(data1.len() + data2.len() + data3.len());
        buf.extend_from_slice(data1);
        buf.extend_from_slice(data2);
        buf.extend_from_slice(data3);
        self.put(tx, coid, buf)
    }

    /// Stores a super-value (cell list) at `coid` directly, bypassing the
    /// blob-only `put`/`put2`/`put3` family; used by the B-tree when it
    /// keeps ephemeral scratch nodes in this backend.
    pub fn put_value(&self, _tx: &MemTransaction, coid: Coid, value: Value) -> CResult<()> {
        self.table.write()?.insert(coid, value);
        Ok(())
    }

    pub fn delete(&self, _tx: &MemTransaction, coid: Coid) -> CResult<bool> {
        Ok(self.table.write()?.remove(&coid).is_some())
    }

    /// Drops every stored value. Mirrors `memKVfreeall`, used between test
    /// runs and when a session's ephemeral tables are torn down.
    pub fn free_all(&self) {
        self.table.write().expect("memkv lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.table.read().expect("memkv lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn coid(n: u64) -> Coid {
        Coid::new(crate::coid::EPHEMDB_CID_BIT, n)
    }

    #[test]
    fn put_then_get_round_trips() {
        let kv = MemKv::new();
        let tx = kv.begin();
        kv.put(&tx, coid(1), vec![1, 2, 3]).unwrap();
        assert_eq!(kv.get(&tx, coid(1)).unwrap().unwrap().as_slice(), &[1, 2, 3]);
        kv.commit(tx).unwrap();
    }

    #[test]
    fn missing_key_reads_as_none() {
        let kv = MemKv::new();
        let tx = kv.begin();
        assert!(kv.get(&tx, coid(42)).unwrap().is_none());
    }

    #[test]
    fn put2_and_put3_concatenate_buffers() {
        let kv = MemKv::new();
        let tx = kv.begin();
        kv.put2(&tx, coid(1), &[1, 2], &[3, 4]).unwrap();
        assert_eq!(kv.get(&tx, coid(1)).unwrap().unwrap().as_slice(), &[1, 2, 3, 4]);
        kv.put3(&tx, coid(2), &[1], &[2], &[3]).unwrap();
        assert_eq!(kv.get(&tx, coid(2)).unwrap().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn get_padded_appends_zero_bytes() {
        let kv = MemKv::new();
        let tx = kv.begin();
        kv.put(&tx, coid(1), vec![9, 9]).unwrap();
        let padded = kv.get_padded(&tx, coid(1), 3).unwrap().unwrap();
        assert_eq!(padded, vec![9, 9, 0, 0, 0]);
    }

    #[test]
    fn delete_reports_whether_key_existed() {
        let kv = MemKv::new();
        let tx = kv.begin();
        kv.put(&tx, coid(1), vec![1]).unwrap();
        assert!(kv.delete(&tx, coid(1)).unwrap());
        assert!(!kv.delete(&tx, coid(1)).unwrap());
    }

    #[test]
    fn free_all_clears_every_stored_value() {
        let kv = MemKv::new();
        let tx = kv.begin();
        kv.put(&tx, coid(1), vec![1]).unwrap();
        kv.put(&tx, coid(2), vec![2]).unwrap();
        kv.free_all();
        assert!(kv.is_empty());
    }

    #[test]
    fn clone_shares_the_same_backing_table() {
        let kv = MemKv::new();
        let kv2 = kv.clone();
        let tx = kv.begin();
        kv.put(&tx, coid(1), vec![7]).unwrap();
        assert_eq!(kv2.get(&tx, coid(1)).unwrap().unwrap().as_slice(), &[7]);
    }

    #[test]
    fn abort_marks_transaction_aborted() {
        let kv = MemKv::new();
        let mut tx = kv.begin();
        assert!(!tx.is_aborted());
        tx.abort();
        assert!(tx.is_aborted());
    }
}
