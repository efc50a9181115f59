//! The server's client-facing surface (§6): the verbs a storage client
//! issues against a COID server, abstracted behind a trait so the same
//! transaction runtime can be driven either in-process (this crate's
//! `LocalChannel`) or, eventually, over a wire transport without touching
//! `ServerState` itself.

use std::sync::Arc;

use crate::coid::Coid;
use crate::error::CResult;
use crate::value::{Cell, IntervalKind, SuperValue, Value};

use super::commit::{CommitOutcome, KvTransaction, ServerState};

/// The verbs a client drives a COID server with. One call per
/// `kvinterface.h` entry point (`KVbegintx`/`KVget`/`KVput`/`KVcommittx`/
/// `KVaborttx`/...), generalized over whatever transport carries them.
pub trait ServerChannel: Send + Sync {
    fn begin_transaction(&self, read_only: bool) -> KvTransaction;
    fn get(&self, tx: &mut KvTransaction, coid: Coid) -> CResult<Option<Value>>;
    fn put(&self, tx: &mut KvTransaction, coid: Coid, data: Vec<u8>) -> CResult<()>;
    fn delete(&self, tx: &mut KvTransaction, coid: Coid) -> CResult<()>;
    fn read_super(&self, tx: &mut KvTransaction, coid: Coid) -> CResult<Option<SuperValue>>;
    fn write_super(&self, tx: &mut KvTransaction, coid: Coid, sv: SuperValue) -> CResult<()>;
    fn list_add(&self, tx: &mut KvTransaction, coid: Coid, cell: Cell) -> CResult<(u32, u32)>;
    fn list_del_range(&self, tx: &mut KvTransaction, coid: Coid, lo: i64, hi: i64, kind: IntervalKind) -> CResult<()>;
    fn attr_set(&self, tx: &mut KvTransaction, coid: Coid, id: u32, value: u64) -> CResult<()>;
    fn commit(&self, tx: KvTransaction) -> CResult<CommitOutcome>;
    fn abort(&self, tx: KvTransaction);
    fn alloc_rowid(&self, cid: u64, hint: u64) -> CResult<u64>;
}

/// An in-process channel: every verb is a direct call into a shared
/// `ServerState`. The production deployment of §6 would swap this for a
/// networked channel without the caller's code changing.
pub struct LocalChannel {
    state: Arc<ServerState>,
}

impl LocalChannel {
    pub fn new(state: Arc<ServerState>) -> Self {
        LocalChannel { state }
    }
}

impl ServerChannel for LocalChannel {
    fn begin_transaction(&self, read_only: bool) -> KvTransaction {
        self.state.begin_transaction(read_only)
    }

    fn get(&self, tx: &mut KvTransaction, coid: Coid) -> CResult<Option<Value>> {
        tx.get(&self.state.cache, coid)
    }

    fn put(&self, tx: &mut KvTransaction, coid: Coid, data: Vec<u8>) -> CResult<()> {
        tx.put(coid, data)
    }

    fn delete(&self, tx: &mut KvTransaction, coid: Coid) -> CResult<()> {
        tx.delete(coid)
    }

    fn read_super(&self, tx: &mut KvTransaction, coid: Coid) -> CResult<Option<SuperValue>> {
        tx.read_super(&self.state.cache, coid)
    }

    fn write_super(&self, tx: &mut KvTransaction, coid: Coid, sv: SuperValue) -> CResult<()> {
        tx.write_super(coid, sv)
    }

    fn list_add(&self, tx: &mut KvTransaction, coid: Coid, cell: Cell) -> CResult<(u32, u32)> {
        tx.list_add(&self.state.cache, coid, cell)
    }

    fn list_del_range(&self, tx: &mut KvTransaction, coid: Coid, lo: i64, hi: i64, kind: IntervalKind) -> CResult<()> {
        tx.list_del_range(coid, lo, hi, kind)
    }

    fn attr_set(&self, tx: &mut KvTransaction, coid: Coid, id: u32, value: u64) -> CResult<()> {
        tx.attr_set(coid, id, value)
    }

    fn commit(&self, tx: KvTransaction) -> CResult<CommitOutcome> {
        self.state.commit_transaction(tx)
    }

    fn abort(&self, tx: KvTransaction) {
        self.state.abort_transaction(tx)
    }

    fn alloc_rowid(&self, cid: u64, hint: u64) -> CResult<u64> {
        self.state.alloc_rowid(cid, hint)
    }
}
