//! Container/object identifiers and their allocation.
//!
//! A [`Coid`] (container-object id) names a versioned value: the `cid`
//! selects which B-tree/table the value belongs to, the `oid` selects a
//! specific node or row within it. Bit layout follows the source system's
//! allocator: an oid packs a 32-bit issuer id, a 16-bit per-issuer counter,
//! and a 16-bit server hint (`issuer << 32 | counter << 16 | server_hint`).
//! A cid's low bit marks it as ephemeral (in-memory only, never durable).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Low bit of a cid: set means the container lives only in the ephemeral
/// in-memory backend and is never checkpointed to disk.
pub const EPHEMDB_CID_BIT: u64 = 1;

/// cid/oid reserved for process-wide bookkeeping (issuer-id counters etc).
pub const BOOKKEEPING_CID: u64 = 0;
pub const BOOKKEEPING_OID: u64 = 0;

/// Object id: issuer (32 bits) | counter (16 bits) | server hint (16 bits).
pub type Oid = u64;

pub fn make_oid(issuer: u64, counter: u64, server_hint: u64) -> Oid {
    assert_eq!(issuer & !0xffff_ffff, 0, "issuer must fit in 32 bits");
    assert_eq!(counter & !0xffff, 0, "counter must fit in 16 bits");
    assert_eq!(server_hint & !0xffff, 0, "server hint must fit in 16 bits");
    (issuer << 32) | (counter << 16) | server_hint
}

pub fn oid_issuer(oid: Oid) -> u64 {
    oid >> 32
}

pub fn oid_counter(oid: Oid) -> u64 {
    (oid >> 16) & 0xffff
}

pub fn oid_server_hint(oid: Oid) -> u64 {
    oid & 0xffff
}

pub fn with_server_hint(oid: Oid, server_hint: u64) -> Oid {
    assert_eq!(server_hint & !0xffff, 0, "server hint must fit in 16 bits");
    (oid & !0xffff) | server_hint
}

/// A container-object id: (cid, oid) pair uniquely naming a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coid {
    pub cid: u64,
    pub oid: Oid,
}

impl Coid {
    pub fn new(cid: u64, oid: Oid) -> Self {
        Coid { cid, oid }
    }

    /// The root node of the B-tree stored under `cid` (oid counter 0).
    pub fn root(cid: u64) -> Self {
        Coid { cid, oid: make_oid(0, 0, 0) }
    }

    /// The existence marker for `cid` (oid counter 1, see [`TableRegistry`]).
    pub fn marker(cid: u64) -> Self {
        Coid { cid, oid: make_oid(0, 1, 0) }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.cid & EPHEMDB_CID_BIT != 0
    }
}

impl std::fmt::Display for Coid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}:{:#x}", self.cid, self.oid)
    }
}

/// Per-process allocator of new oids: hands out a fresh issuer id (persisted
/// in the bookkeeping container) whenever the current issuer's counter space
/// (16 bits) is exhausted, then allocates sequential counters under it.
///
/// Mirrors the `NewIssuerId`/`NewOid` pair from the source allocator, where
/// `MyOidIssuerId`/`MyOidCounter` were thread-local; here they are
/// instance-local to whatever client/server object owns an `IssuerAllocator`.
pub struct IssuerAllocator {
    issuer_id: AtomicU64,
    counter: AtomicU32,
}

impl IssuerAllocator {
    pub fn new() -> Self {
        IssuerAllocator { issuer_id: AtomicU64::new(0), counter: AtomicU32::new(0xffff) }
    }

    /// Allocates a new oid, requesting a fresh issuer id from `next_issuer`
    /// when the current issuer's 16-bit counter space is exhausted.
    pub fn next_oid(&self, next_issuer: impl FnOnce() -> CResult<u64>) -> CResult<Oid> {
        if self.issuer_id.load(Ordering::SeqCst) == 0 || self.counter.load(Ordering::SeqCst) > 0xffff {
            let issuer = next_issuer()?;
            assert_eq!(issuer & !0xffff_ffff, 0);
            self.issuer_id.store(issuer, Ordering::SeqCst);
            self.counter.store(0, Ordering::SeqCst);
        }
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        if counter > 0xffff {
            return Err(Error::OutOfResource("oid counter space exhausted".into()));
        }
        Ok(make_oid(self.issuer_id.load(Ordering::SeqCst), counter as u64, 0))
    }
}

impl Default for IssuerAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry of in-use database ids, guarding against handing
/// out the same ephemeral db-id range twice. Grounded in
/// `coid.cpp`'s `UsedDBIds`/`LastUsedDBId`/`markusedDBId`/`newMemDBId`/
/// `freeMemDBId`.
pub struct DbIdRegistry {
    used: Mutex<HashSet<u64>>,
    last: AtomicU64,
}

impl DbIdRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(DbIdRegistry { used: Mutex::new(HashSet::new()), last: AtomicU64::new(0) })
    }

    /// Hashes a database name into a dbid, matching `nameToDbid`'s simple
    /// rolling hash and ephemeral-bit convention.
    pub fn name_to_dbid(name: &str, ephemeral: bool) -> u64 {
        let mut h: u64 = 0;
        for b in name.as_bytes() {
            h = (h << 3) ^ h ^ (b.to_ascii_lowercase() as u64);
        }
        let dbid = h & 0xffff_ffff;
        if ephemeral { dbid | EPHEMDB_CID_BIT } else { dbid & !EPHEMDB_CID_BIT }
    }

    pub fn mark_used(&self, dbid: u64) -> CResult<()> {
        self.used.lock()?.insert(dbid);
        Ok(())
    }

    /// Allocates a fresh, unused ephemeral (or durable) dbid.
    pub fn new_dbid(&self, ephemeral: bool) -> CResult<u64> {
        let mut used = self.used.lock()?;
        loop {
            let mut candidate = self.last.fetch_add(1, Ordering::SeqCst) + 1;
            if candidate & !0x7fff_ffff != 0 {
                return Err(Error::OutOfResource("database id space exhausted".into()));
            }
            if ephemeral {
                candidate |= EPHEMDB_CID_BIT;
            } else {
                candidate &= !EPHEMDB_CID_BIT;
            }
            if used.insert(candidate) {
                return Ok(candidate);
            }
        }
    }

    pub fn free_dbid(&self, dbid: u64) -> CResult<()> {
        self.used.lock()?.remove(&dbid);
        Ok(())
    }

    pub fn is_ephemeral(dbid: u64) -> bool {
        dbid & EPHEMDB_CID_BIT != 0
    }
}
