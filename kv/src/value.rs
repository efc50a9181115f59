//! Value containers stored under a [`crate::coid::Coid`]: plain blobs and
//! "super-values" (an ordered cell list plus attributes), as read/written by
//! `KVget`/`KVput*`/`KVreadSuperValue`/`KVwriteSuperValue` in the source
//! interface. Both containers are `Arc`-backed with copy-on-write mutation,
//! the same sharing discipline the engine already applies to its own
//! `Arc<Mutex<E>>` handle.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// An opaque, reference-counted, copy-on-write byte blob.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blob(Arc<Vec<u8>>);

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Blob(Arc::new(data))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mutable access to the payload. Deep-copies if this blob's `Arc` is
    /// currently shared (refcount > 1); cheap if this is the sole owner.
    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.0)
    }
}

impl From<Vec<u8>> for Blob {
    fn from(data: Vec<u8>) -> Self {
        Blob::new(data)
    }
}

/// Ascending or descending ordering for a key column, used by [`KeyInfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Descriptor for how a super-value's cells are ordered: one [`SortOrder`]
/// per key column, plus an optional custom comparator for non-numeric keys.
/// Mirrors the `RcKeyInfo` parameter threaded through `KVreadSuperValue`/
/// `KVlistadd`/`KVlistdelrange` in the source interface.
#[derive(Clone)]
pub struct KeyInfo {
    pub orders: Vec<SortOrder>,
    comparator: Option<Arc<dyn Fn(i64, i64) -> CmpOrdering + Send + Sync>>,
}

impl KeyInfo {
    /// Default key-info used by the B-tree's internal nodes: a single
    /// ascending numeric column, compared by plain integer order.
    pub fn numeric_ascending() -> Self {
        KeyInfo { orders: vec![SortOrder::Ascending], comparator: None }
    }

    pub fn with_comparator(
        orders: Vec<SortOrder>,
        comparator: Arc<dyn Fn(i64, i64) -> CmpOrdering + Send + Sync>,
    ) -> Self {
        KeyInfo { orders, comparator: Some(comparator) }
    }

    pub fn compare(&self, a: i64, b: i64) -> CmpOrdering {
        let base = match &self.comparator {
            Some(cmp) => cmp(a, b),
            None => a.cmp(&b),
        };
        match self.orders.first() {
            Some(SortOrder::Descending) => base.reverse(),
            _ => base,
        }
    }
}

impl std::fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyInfo")
            .field("orders", &self.orders)
            .field("comparator", &self.comparator.is_some())
            .finish()
    }
}

impl Default for KeyInfo {
    fn default() -> Self {
        Self::numeric_ascending()
    }
}

/// One entry of a super-value's cell list: a numeric key, an opaque payload,
/// and (for B-tree internal nodes) the coid of the child the key routes to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub key: i64,
    pub payload: Vec<u8>,
    pub child: Option<crate::coid::Coid>,
}

impl Cell {
    pub fn leaf(key: i64, payload: Vec<u8>) -> Self {
        Cell { key, payload, child: None }
    }

    pub fn internal(key: i64, child: crate::coid::Coid) -> Self {
        Cell { key, payload: Vec::new(), child: Some(child) }
    }
}

/// The half-open/closed/open interval shape accepted by a delete-range
/// request, matching `KVlistdelrange`'s `intervalType` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalKind {
    /// [lo, hi)
    ClosedOpen,
    /// [lo, hi]
    Closed,
    /// (lo, hi)
    Open,
    /// (lo, hi]
    OpenClosed,
}

impl IntervalKind {
    pub fn contains(&self, lo: i64, hi: i64, key: i64) -> bool {
        match self {
            IntervalKind::ClosedOpen => key >= lo && key < hi,
            IntervalKind::Closed => key >= lo && key <= hi,
            IntervalKind::Open => key > lo && key < hi,
            IntervalKind::OpenClosed => key > lo && key <= hi,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SuperValueInner {
    cells: Vec<Cell>,
    attrs: std::collections::BTreeMap<u32, u64>,
}

/// An ordered cell list plus a small attribute set, the unit a distributed
/// B-tree node (or any multi-field row) is stored as. `Arc`-backed,
/// copy-on-write on the first mutation after a clone.
#[derive(Clone, Debug, Default)]
pub struct SuperValue {
    inner: Arc<SuperValueInner>,
    pub key_info: Arc<KeyInfo>,
}

impl SuperValue {
    pub fn new(key_info: KeyInfo) -> Self {
        SuperValue { inner: Arc::new(SuperValueInner::default()), key_info: Arc::new(key_info) }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.inner.cells
    }

    pub fn attr(&self, id: u32) -> Option<u64> {
        self.inner.attrs.get(&id).copied()
    }

    pub fn attrs(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.inner.attrs.iter().map(|(&id, &value)| (id, value))
    }

    pub fn set_attr(&mut self, id: u32, value: u64) {
        Arc::make_mut(&mut self.inner).attrs.insert(id, value);
    }

    /// Inserts a cell in key order, replacing any existing cell with the
    /// same key (duplicate keys are not allowed within one super-value).
    pub fn insert_cell(&mut self, cell: Cell) {
        let key_info = self.key_info.clone();
        let inner = Arc::make_mut(&mut self.inner);
        match inner.cells.binary_search_by(|c| key_info.compare(c.key, cell.key)) {
            Ok(pos) => inner.cells[pos] = cell,
            Err(pos) => inner.cells.insert(pos, cell),
        }
    }

    pub fn find_cell(&self, key: i64) -> Option<&Cell> {
        self.inner
            .cells
            .binary_search_by(|c| self.key_info.compare(c.key, key))
            .ok()
            .map(|pos| &self.inner.cells[pos])
    }

    /// Removes all cells whose key falls within `[lo, hi)` per `kind`.
    /// Returns the number of cells removed.
    pub fn delete_range(&mut self, lo: i64, hi: i64, kind: IntervalKind) -> usize {
        let inner = Arc::make_mut(&mut self.inner);
        let before = inner.cells.len();
        inner.cells.retain(|c| !kind.contains(lo, hi, c.key));
        before - inner.cells.len()
    }

    pub fn len(&self) -> usize {
        self.inner.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cells.is_empty()
    }

    /// Splits off the cells at or after `at_key`, returning them as a new
    /// super-value sharing the same key-info. Used by the B-tree splitter.
    pub fn split_at(&mut self, at_key: i64) -> SuperValue {
        let inner = Arc::make_mut(&mut self.inner);
        let pos = inner.cells.partition_point(|c| self.key_info.compare(c.key, at_key) == CmpOrdering::Less);
        let tail = inner.cells.split_off(pos);
        SuperValue {
            inner: Arc::new(SuperValueInner { cells: tail, attrs: std::collections::BTreeMap::new() }),
            key_info: self.key_info.clone(),
        }
    }
}

impl PartialEq for SuperValue {
    /// Content equality: compares cells and attributes, ignoring `key_info`
    /// (a comparator strategy, not data).
    fn eq(&self, other: &Self) -> bool {
        self.inner.cells == other.inner.cells && self.inner.attrs == other.inner.attrs
    }
}

/// A value read back from storage: either a plain blob or a super-value.
/// Attempting to read one shape as the other is a [`Error::WrongType`].
#[derive(Clone, Debug)]
pub enum Value {
    Blob(Blob),
    Super(SuperValue),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Super(a), Value::Super(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn as_blob(&self) -> CResult<&Blob> {
        match self {
            Value::Blob(b) => Ok(b),
            Value::Super(_) => Err(Error::WrongType),
        }
    }

    pub fn as_super(&self) -> CResult<&SuperValue> {
        match self {
            Value::Super(s) => Ok(s),
            Value::Blob(_) => Err(Error::WrongType),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coid::Coid;

    #[test]
    fn blob_cow_deep_copies_only_when_shared() {
        let mut a = Blob::new(vec![1, 2, 3]);
        let b = a.clone();
        a.make_mut().push(4);
        assert_eq!(a.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(b.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn super_value_keeps_cells_sorted_on_insert() {
        let mut sv = SuperValue::new(KeyInfo::numeric_ascending());
        sv.insert_cell(Cell::leaf(3, vec![3]));
        sv.insert_cell(Cell::leaf(1, vec![1]));
        sv.insert_cell(Cell::leaf(2, vec![2]));
        let keys: Vec<i64> = sv.cells().iter().map(|c| c.key).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn super_value_insert_replaces_duplicate_key() {
        let mut sv = SuperValue::new(KeyInfo::numeric_ascending());
        sv.insert_cell(Cell::leaf(1, vec![1]));
        sv.insert_cell(Cell::leaf(1, vec![9]));
        assert_eq!(sv.len(), 1);
        assert_eq!(sv.find_cell(1).unwrap().payload, vec![9]);
    }

    #[test]
    fn delete_range_honors_interval_kind() {
        let mut sv = SuperValue::new(KeyInfo::numeric_ascending());
        for k in 0..10 {
            sv.insert_cell(Cell::leaf(k, vec![]));
        }
        let removed = sv.delete_range(2, 5, IntervalKind::ClosedOpen);
        assert_eq!(removed, 3); // 2,3,4
        let keys: Vec<i64> = sv.cells().iter().map(|c| c.key).collect();
        assert_eq!(keys, vec![0, 1, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn split_at_divides_cells_and_shares_key_info() {
        let mut sv = SuperValue::new(KeyInfo::numeric_ascending());
        for k in 0..6 {
            sv.insert_cell(Cell::leaf(k, vec![]));
        }
        let tail = sv.split_at(3);
        let head_keys: Vec<i64> = sv.cells().iter().map(|c| c.key).collect();
        let tail_keys: Vec<i64> = tail.cells().iter().map(|c| c.key).collect();
        assert_eq!(head_keys, vec![0, 1, 2]);
        assert_eq!(tail_keys, vec![3, 4, 5]);
    }

    #[test]
    fn internal_cell_carries_child_coid() {
        let child = Coid::new(1, 2);
        let cell = Cell::internal(10, child);
        assert_eq!(cell.child, Some(child));
    }

    #[test]
    fn wrong_type_access_is_rejected() {
        let value = Value::Blob(Blob::new(vec![1]));
        assert!(matches!(value.as_super(), Err(Error::WrongType)));
    }
}
