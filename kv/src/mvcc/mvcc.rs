//! This mod implements MVCC (Multi-Version Concurrency Control), a widely used method for ACID transactions and concurrency control.
//! It allows multiple concurrent transactions to access and modify the same dataset, isolates them from each other,
//! detects and handles conflicts, and commits their writes atomically as a single unit.
//! It uses an underlying storage engine to store raw keys and values.
//!
//!
//! VERSIONS
//! ========
//! MVCC handles concurrency control by managing multiple historical versions of keys, identified by a timestamp.
//! Every write adds a new version at a higher timestamp, with deletes having a special tombstone value.
//!
//! For example, the keys a,b,c,d may have the following values at various logical timestamps (x is tombstone):
//!
//! Time
//! 5
//! 4  a4
//! 3      b3      x
//! 2
//! 1  a1      c1  d1
//!    a   b   c   d   Keys
//!
//! * At time t1, a transaction writes a=a1,c=c1,d=d1 and commits it.
//! * At time t2, transaction T2 is started, will see the values a=a1, c=c1, d=d1.
//! * At t3, a transaction writes b=b3 and deletes D.
//! * At t4, a transaction writes a=a4.
//! * A different transaction t5 running at T=5 will see a=a4, b=b3, c=c1.
//!
//! KV Storage Engine uses logical timestamps with a sequence number stored in `Key::NextVersion`.
//! Each new read-write transaction takes its timestamp from the current value of `Key::NextVersion`
//! and then increments the value for the next transaction.
//!
//!
//! ISOLATION
//! =========
//! MVCC provides an isolation level called snapshot isolation.
//! Briefly, transactions see a consistent snapshot of the database state as of their start time.
//! Writes made by concurrent or subsequent transactions are never visible to it.
//! If two concurrent transactions write to the same key they will conflict and one of them must retry.
//! A transaction's writes become atomically visible to subsequent transactions only when they commit,
//! and are rolled back on failure.
//! Read-only transactions never conflict with other transactions.
//!
//! Transactions write new versions at their timestamp, storing them as `Key::Version(key, version) => value`.
//! If a transaction writes to a key and finds a newer version, it returns an error and the client must retry.
//!
//! Active (uncommitted) read-write transactions record their version in the active set,
//! stored as `Key::TxnActive(version)`.
//! When new transactions begin, they take a snapshot of this active set,
//! and any key versions that belong to a transaction in the active set are considered `invisible` (to anyone except that transaction itself).
//! Writes to keys that already have a past version in the active set will also return an error.
//!
//! To commit, a transaction simply deletes its record in the active set.
//! This will immediately (and, crucially, atomically) make all of its writes visible to subsequent transactions,
//! but not ongoing ones. If the transaction is cancelled and rolled back,
//! it maintains a record of all keys it wrote as `Key::TxnWrite(version, key)`,
//! so that it can find the corresponding versions and delete them before removing itself from the active set.
//!
//! For example, Consider the following example, where we have two ongoing transactions at time T=2 and T=5,
//! with some writes that are not yet committed marked in parentheses.
//!
//! Active set: [2, 5]
//!
//! Time
//! 5 (a5)
//! 4  a4
//! 3      b3      x
//! 2         (x)     (e2)
//! 1  a1      c1  d1
//!    a   b   c   d   e   Keys
//!
//! * (x): delete key
//! * (e2): put data but uncommit
//!
//! * The data written by transaction T5 is not committed, and T5 is maintained in the Active set.
//!   T5 does not see the tombstone at c@2 nor the value e=e2, because version=2 is in its active set.
//! * T2 deleting c1 and writing e2 are visible to itself, but not to the transaction T5 opened later.
//!   T2 will see a=a1, d=d1, e=e2 (it sees its own writes). T2 does not see any newer versions
//!
//! To commit, t2 can remove itself from the active set.
//! A new transaction t6 starting after the commit will then see c as deleted and e=e2.
//! t5 will still not see any of t2's writes, because it's still in its local snapshot of the active set at the time it began.
//!
//!
//! mvcc:
//!   Writers don't block readers.
//!   Readers don't block writers.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use serde_derive::{Deserialize, Serialize};
use crate::error::CResult;
use crate::mvcc::transaction::{Transaction, TransactionDef, TransactionState};
use crate::mvcc::Version;
use crate::storage::engine::Engine;

/// An MVCC-based transactional key-value engine.
/// It wraps an underlying storage engine that's used for raw key/value storage.
pub struct MVCC<E: Engine> {
    engine: Arc<Mutex<E>>,
}

pub(crate) trait MVCCDef<E: Engine> {
    fn new(engine: E) -> MVCC<E>;

    fn begin(&self) -> CResult<Transaction<E>>;

    fn begin_read_only(&self) -> CResult<Transaction<E>>;

    fn resume(&self, state: TransactionState) -> CResult<Transaction<E>>;

    fn status(&self) -> CResult<Status>;
}

/// Order-preserving byte encoding for MVCC keys: user key bytes are escaped
/// (0x00 -> 0x00 0xff) and terminated with 0x00 0x00, so that appending a
/// fixed-width suffix (a version number) after an escaped key never changes
/// the lexicographic order of the encoded keys relative to the order of the
/// original unescaped keys. Versions are encoded big-endian so byte order
/// matches numeric order.
mod keycode {
    use crate::error::{CResult, Error};

    pub fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
        out.reserve(bytes.len() + 2);
        for &b in bytes {
            if b == 0x00 {
                out.push(0x00);
                out.push(0xff);
            } else {
                out.push(b);
            }
        }
        out.push(0x00);
        out.push(0x00);
    }

    pub fn decode_bytes(input: &[u8]) -> CResult<(Vec<u8>, &[u8])> {
        let mut decoded = Vec::new();
        let mut i = 0;
        loop {
            match input.get(i) {
                Some(0x00) => match input.get(i + 1) {
                    Some(0xff) => {
                        decoded.push(0x00);
                        i += 2;
                    }
                    Some(0x00) => return Ok((decoded, &input[i + 2..])),
                    _ => return Err(Error::Corruption("invalid key byte encoding".into())),
                },
                Some(b) => {
                    decoded.push(*b);
                    i += 1;
                }
                None => return Err(Error::Corruption("unterminated key byte encoding".into())),
            }
        }
    }

    pub fn encode_u64(v: u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    pub fn decode_u64(input: &[u8]) -> CResult<(u64, &[u8])> {
        if input.len() < 8 {
            return Err(Error::Corruption("truncated version encoding".into()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&input[..8]);
        Ok((u64::from_be_bytes(buf), &input[8..]))
    }
}

/// MVCC keys, using the KeyCode encoding which preserves the ordering and grouping of keys.
/// Cow byte slices allow encoding borrowed values and decoding into owned values.
#[derive(Debug)]
pub enum Key<'a> {
    /// The next available version.
    NextVersion,

    /// Active (uncommitted) transactions by version.
    TxnActive(Version),

    /// `A snapshot of the active set` at each version.
    /// Only written for versions where the active set is non-empty (excluding itself).
    TxnActiveSnapshot(Version),

    /// Keeps track of all keys written to by an active transaction (identified by its version), in case it needs to roll back.
    TxnWrite(Version, Cow<'a, [u8]>),

    /// A versioned key/value pair.
    Version(Cow<'a, [u8]>, Version),

    /// Unversioned non-transactional key/value pairs.
    /// These exist separately from versioned keys, i.e. the unversioned key "abcdefg" is entirely independent of the versioned key "abcdefg@7".
    /// These are mostly used for metadata.
    Unversioned(Cow<'a, [u8]>),
}

impl<'a> Key<'a> {
    pub fn decode(bytes: &'a [u8]) -> CResult<Self> {
        let (tag, rest) =
            bytes.split_first().ok_or_else(|| crate::error::Error::Corruption("empty mvcc key".into()))?;
        Ok(match tag {
            0x00 => Key::NextVersion,
            0x01 => Key::TxnActive(keycode::decode_u64(rest)?.0),
            0x02 => Key::TxnActiveSnapshot(keycode::decode_u64(rest)?.0),
            0x03 => {
                let (v, rest) = keycode::decode_u64(rest)?;
                let (key, _) = keycode::decode_bytes(rest)?;
                Key::TxnWrite(v, Cow::Owned(key))
            }
            0x04 => {
                let (key, rest) = keycode::decode_bytes(rest)?;
                let (v, _) = keycode::decode_u64(rest)?;
                Key::Version(Cow::Owned(key), v)
            }
            0x05 => {
                let (key, _) = keycode::decode_bytes(rest)?;
                Key::Unversioned(Cow::Owned(key))
            }
            other => return Err(crate::error::Error::Corruption(format!("unknown mvcc key tag {other}"))),
        })
    }

    pub fn encode(&self) -> CResult<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Key::NextVersion => out.push(0x00),
            Key::TxnActive(v) => {
                out.push(0x01);
                keycode::encode_u64(*v, &mut out);
            }
            Key::TxnActiveSnapshot(v) => {
                out.push(0x02);
                keycode::encode_u64(*v, &mut out);
            }
            Key::TxnWrite(v, key) => {
                out.push(0x03);
                keycode::encode_u64(*v, &mut out);
                keycode::encode_bytes(key, &mut out);
            }
            Key::Version(key, v) => {
                out.push(0x04);
                keycode::encode_bytes(key, &mut out);
                keycode::encode_u64(*v, &mut out);
            }
            Key::Unversioned(key) => {
                out.push(0x05);
                keycode::encode_bytes(key, &mut out);
            }
        }
        Ok(out)
    }
}

/// MVCC key prefixes, for prefix scans. These must match the keys above, including the enum variant index.
#[derive(Debug)]
pub(crate) enum KeyPrefix<'a> {
    NextVersion,

    TxnActive,

    TxnActiveSnapshot,

    TxnWrite(Version),

    Version(Cow<'a, [u8]>),

    Unversioned,
}

impl<'a> KeyPrefix<'a> {
    pub(crate) fn encode(&self) -> CResult<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            KeyPrefix::NextVersion => out.push(0x00),
            KeyPrefix::TxnActive => out.push(0x01),
            KeyPrefix::TxnActiveSnapshot => out.push(0x02),
            KeyPrefix::TxnWrite(v) => {
                out.push(0x03);
                keycode::encode_u64(*v, &mut out);
            }
            KeyPrefix::Version(key) => {
                out.push(0x04);
                keycode::encode_bytes(key, &mut out);
            }
            KeyPrefix::Unversioned => out.push(0x05),
        }
        Ok(out)
    }
}

impl <E: Engine> MVCCDef<E> for MVCC<E> {
    fn new(engine: E) -> MVCC<E> {
        MVCC {
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    fn begin(&self) -> CResult<Transaction<E>> {
        Transaction::begin(self.engine.clone())
    }

    fn begin_read_only(&self) -> CResult<Transaction<E>> {
        Transaction::begin_read_only(self.engine.clone(), None)
    }

    fn resume(&self, state: TransactionState) -> CResult<Transaction<E>> {
        Transaction::resume(self.engine.clone(), state)
    }

    fn status(&self) -> CResult<Status> {
        let mut engine = self.engine.lock()?;
        let mut session = engine.scan_prefix(&KeyPrefix::TxnActive.encode()?);
        let mut active_txns = 0u64;
        while session.next().transpose()?.is_some() {
            active_txns += 1;
        }
        let versions = match engine.get(&Key::NextVersion.encode()?)? {
            Some(ref v) => bincode::deserialize::<u64>(v)?.saturating_sub(1),
            None => 0,
        };
        Ok(Status { versions, active_txns, storage: engine.status()? })
    }
}

impl<E: Engine> Clone for MVCC<E> {
    fn clone(&self) -> Self {
        MVCC { engine: self.engine.clone() }
    }
}

/// MVCC engine status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The total number of MVCC versions (i.e.  read-write transactions).
    pub versions: u64,
    /// Number of currently active transactions.
    pub active_txns: u64,
    /// The storage engine.
    pub storage: super::super::storage::Status,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::Memory;

    fn new_mvcc() -> MVCC<Memory> {
        MVCC::new(Memory::new())
    }

    #[test]
    fn key_encode_decode_round_trips_every_variant() {
        let cases: Vec<Key> = vec![
            Key::NextVersion,
            Key::TxnActive(7),
            Key::TxnActiveSnapshot(7),
            Key::TxnWrite(7, Cow::Borrowed(b"foo")),
            Key::Version(Cow::Borrowed(b"foo"), 7),
            Key::Unversioned(Cow::Borrowed(b"foo")),
        ];
        for key in cases {
            let encoded = key.encode().unwrap();
            let decoded = Key::decode(&encoded).unwrap();
            assert_eq!(format!("{key:?}"), format!("{decoded:?}"));
        }
    }

    #[test]
    fn key_encode_preserves_user_key_lexicographic_order() {
        let a = Key::Version(Cow::Borrowed(b"a"), 9).encode().unwrap();
        let b = Key::Version(Cow::Borrowed(b"b"), 1).encode().unwrap();
        assert!(a < b, "key 'a' at any version must sort before key 'b' at any version");
    }

    #[test]
    fn key_encode_preserves_version_numeric_order_within_same_key() {
        let v1 = Key::Version(Cow::Borrowed(b"k"), 1).encode().unwrap();
        let v2 = Key::Version(Cow::Borrowed(b"k"), 2).encode().unwrap();
        assert!(v1 < v2);
    }

    #[test]
    fn key_with_embedded_zero_byte_round_trips() {
        let key = Key::Version(Cow::Borrowed(&[0x00, 0x01, 0x00]), 3);
        let encoded = key.encode().unwrap();
        let decoded = Key::decode(&encoded).unwrap();
        match decoded {
            Key::Version(k, v) => {
                assert_eq!(k.as_ref(), &[0x00, 0x01, 0x00]);
                assert_eq!(v, 3);
            }
            other => panic!("unexpected decode {other:?}"),
        }
    }

    #[test]
    fn status_reports_versions_and_active_transactions() {
        let mvcc = new_mvcc();
        let t1 = mvcc.begin().unwrap();
        let _t2 = mvcc.begin().unwrap();
        t1.commit().unwrap();
        let status = mvcc.status().unwrap();
        assert_eq!(status.versions, 2);
        assert_eq!(status.active_txns, 1);
    }
}
