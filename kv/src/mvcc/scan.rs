use std::collections::Bound;
use std::sync::MutexGuard;
use crate::error::CResult;
use crate::mvcc::mvcc::Key;
use crate::mvcc::transaction::TransactionState;
use crate::mvcc::Version;
use crate::storage::engine::Engine;

/// A scan result. Can produce an iterator or collect an owned Vec.
///
/// This intermediate struct is unfortunately needed to hold the MutexGuard for the scan() caller,
/// since placing it in ScanIterator along with the inner iterator borrowing from it would create a self-referential struct.
pub struct Scan<'a, E: Engine + 'a> {
    /// Access to the locked engine.
    engine: MutexGuard<'a, E>,

    /// The transaction state.
    txn: &'a TransactionState,

    /// The scan type and parameter.
    param: ScanType,
}

enum ScanType {
    Range((Bound<Vec<u8>>, Bound<Vec<u8>>)),
    Prefix(Vec<u8>),
}

impl<'a, E: Engine + 'a> Scan<'a, E> {
    pub(crate) fn new(
        engine: MutexGuard<'a, E>,
        txn: &'a TransactionState,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
    ) -> Self {
        Self { engine, txn, param: ScanType::Range((start, end)) }
    }

    /// Creates a new prefix scan.
    pub(crate) fn new_prefix(engine: MutexGuard<'a, E>, txn: &'a TransactionState, prefix: Vec<u8>) -> Self {
        Self { engine, txn, param: ScanType::Prefix(prefix) }
    }

    /// Runs the scan, returning an iterator over the latest live and visible
    /// key/value pairs at the transaction's version.
    pub fn into_iter(self) -> ScanIterator<'a, E> {
        let Scan { mut engine, txn, param } = self;
        let inner = match param {
            ScanType::Range((start, end)) => engine.scan((start, end)),
            ScanType::Prefix(prefix) => engine.scan_prefix(&prefix),
        };
        ScanIterator::new(txn, inner)
    }
}

/// An iterator over the latest live and visible key/value pairs at the txn
/// version.
pub struct ScanIterator<'a, E: Engine + 'a> {
    /// Decodes and filters visible MVCC versions from the inner engine iterator.
    inner: std::iter::Peekable<VersionIterator<'a, E>>,

    last: Option<Vec<u8>>,
}

impl<'a, E: Engine + 'a> ScanIterator<'a, E> {
    fn new(txn: &'a TransactionState, inner: E::ScanIterator<'a>) -> Self {
        Self { inner: VersionIterator::new(txn, inner).peekable(), last: None }
    }

    /// Fallible next(), emitting the next item, or None if exhausted.
    ///
    /// Versions arrive from the inner iterator in ascending (key, version)
    /// order, so all versions of a given key are contiguous and the last
    /// one seen before the key changes is the highest (most recent)
    /// visible version — the only one worth emitting.
    fn try_next(&mut self) -> CResult<Option<(Vec<u8>, Vec<u8>)>> {
        while let Some((key, _version, value)) = self.inner.next().transpose()? {
            let is_last_version_of_key = match self.inner.peek() {
                Some(Ok((peek_key, _, _))) => peek_key != &key,
                Some(Err(_)) | None => true,
            };
            if is_last_version_of_key {
                if let Some(value) = bincode::deserialize::<Option<Vec<u8>>>(&value)? {
                    return Ok(Some((key, value)));
                }
                // Tombstone: the latest version of this key is a delete.
            }
        }
        Ok(None)
    }

    /// Fallible next_back(), emitting the next item from the back, or None if exhausted.
    ///
    /// Walking backward visits versions in descending order, so the first
    /// time a key is seen is already its highest (most recent) version;
    /// `last` tracks which key was last resolved so older versions of the
    /// same key are skipped until a new key appears.
    fn try_next_back(&mut self) -> CResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let (key, _version, value) = match self.inner.next_back().transpose()? {
                Some(item) => item,
                None => return Ok(None),
            };
            if self.last.as_deref() == Some(key.as_slice()) {
                continue;
            }
            self.last = Some(key.clone());
            if let Some(value) = bincode::deserialize::<Option<Vec<u8>>>(&value)? {
                return Ok(Some((key, value)));
            }
            // Tombstone: keep scanning backwards for the next distinct key.
        }
    }
}

impl<'a, E: Engine> Iterator for ScanIterator<'a, E> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

impl<'a, E: Engine> DoubleEndedIterator for ScanIterator<'a, E> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.try_next_back().transpose()
    }
}

/// An iterator that decodes raw engine key/value pairs into MVCC key/value versions, and skips invisible versions. Helper for ScanIterator.
struct VersionIterator<'a, E: Engine + 'a> {
    /// The transaction the scan is running in.
    txn: &'a TransactionState,

    /// The inner engine scan iterator.
    inner: E::ScanIterator<'a>,
}

impl<'a, E: Engine> VersionIterator<'a, E> {
    fn new(txn: &'a TransactionState, inner: E::ScanIterator<'a>) -> Self {
        Self { txn, inner }
    }

    /// Fallible next(), emitting the next item, or None if exhausted.
    fn try_next(&mut self) -> CResult<Option<(Vec<u8>, Version, Vec<u8>)>> {
        while let Some((key, value)) = self.inner.next().transpose()? {
            match Key::decode(&key)? {
                Key::Version(key, version) => {
                    if self.txn.is_visible(version) {
                        return Ok(Some((key.into_owned(), version, value)));
                    }
                }
                key => return Err(crate::error::Error::Internal(format!("expected Version key, got {key:?}"))),
            }
        }
        Ok(None)
    }

    /// Fallible next_back(), emitting the previous item, or None if exhausted.
    fn try_next_back(&mut self) -> CResult<Option<(Vec<u8>, Version, Vec<u8>)>> {
        while let Some((key, value)) = self.inner.next_back().transpose()? {
            match Key::decode(&key)? {
                Key::Version(key, version) => {
                    if self.txn.is_visible(version) {
                        return Ok(Some((key.into_owned(), version, value)));
                    }
                }
                key => return Err(crate::error::Error::Internal(format!("expected Version key, got {key:?}"))),
            }
        }
        Ok(None)
    }
}

impl<'a, E: Engine> Iterator for VersionIterator<'a, E> {
    type Item = CResult<(Vec<u8>, Version, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

impl<'a, E: Engine> DoubleEndedIterator for VersionIterator<'a, E> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.try_next_back().transpose()
    }
}
