//! A distributed B-tree node (§4.5-4.6): a [`SuperValue`] stored under a
//! [`Coid`], cells ordered by key, with two reserved attribute ids carrying
//! node metadata that doesn't belong in the cell list itself: whether the
//! node is a leaf, and its right-sibling pointer for leaf-to-leaf scanning.

use crate::coid::Coid;
use crate::error::{CResult, Error};
use crate::value::{Cell, KeyInfo, SuperValue};

pub const ATTR_IS_LEAF: u32 = 0;
pub const ATTR_RIGHT_SIBLING_CID: u32 = 1;
pub const ATTR_RIGHT_SIBLING_OID: u32 = 2;

/// Minimum cell count a split will leave on either side, per §4.6.
pub const SPLIT_MIN_SIZE: usize = 3;

/// One node of the tree, addressed by the coid it's stored under.
#[derive(Clone, Debug)]
pub struct Node {
    pub coid: Coid,
    pub sv: SuperValue,
}

impl Node {
    pub fn empty_leaf(coid: Coid) -> Self {
        let mut sv = SuperValue::new(KeyInfo::numeric_ascending());
        sv.set_attr(ATTR_IS_LEAF, 1);
        Node { coid, sv }
    }

    pub fn empty_internal(coid: Coid) -> Self {
        let mut sv = SuperValue::new(KeyInfo::numeric_ascending());
        sv.set_attr(ATTR_IS_LEAF, 0);
        Node { coid, sv }
    }

    /// Wraps an already-read super-value, as returned by a transaction's
    /// `read_super`. A node with no `ATTR_IS_LEAF` attribute (never
    /// written) is treated as a leaf, matching `empty_leaf`'s default.
    pub fn from_super_value(coid: Coid, sv: SuperValue) -> Self {
        Node { coid, sv }
    }

    pub fn is_leaf(&self) -> bool {
        self.sv.attr(ATTR_IS_LEAF).unwrap_or(1) != 0
    }

    pub fn right_sibling(&self) -> Option<Coid> {
        let cid = self.sv.attr(ATTR_RIGHT_SIBLING_CID)?;
        let oid = self.sv.attr(ATTR_RIGHT_SIBLING_OID).unwrap_or(0);
        Some(Coid::new(cid, oid))
    }

    pub fn set_right_sibling(&mut self, sibling: Option<Coid>) {
        match sibling {
            Some(coid) => {
                self.sv.set_attr(ATTR_RIGHT_SIBLING_CID, coid.cid);
                self.sv.set_attr(ATTR_RIGHT_SIBLING_OID, coid.oid);
            }
            None => {
                self.sv.set_attr(ATTR_RIGHT_SIBLING_CID, 0);
                self.sv.set_attr(ATTR_RIGHT_SIBLING_OID, 0);
            }
        }
    }

    pub fn cells(&self) -> &[Cell] {
        self.sv.cells()
    }

    pub fn len(&self) -> usize {
        self.sv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sv.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.sv.cells().iter().map(|c| c.payload.len() + 16).sum()
    }

    /// The child to descend into for `key`, per §4.5's "binary-search the
    /// current node under its comparator; if internal, descend to the
    /// child indicated by the separator." Ties among separator keys are
    /// not expected (separators are kept unique by the splitter), so no
    /// child-coid tiebreak is needed in practice.
    pub fn find_child(&self, key: i64) -> CResult<Coid> {
        if self.is_leaf() {
            return Err(Error::Corruption("find_child called on a leaf node".into()));
        }
        let mut chosen = None;
        for cell in self.sv.cells() {
            if cell.key <= key {
                chosen = cell.child;
            } else {
                break;
            }
        }
        chosen.ok_or_else(|| Error::Corruption(format!("no separator covers key {key}")))
    }

    /// Whether a leaf this node claims to be could still own `key`: a
    /// conservative check for the direct-seek cache. True if the leaf has
    /// no cells yet, or `key` is at or after its first cell and (when it
    /// has a right sibling) at or before its last cell.
    pub fn covers_leaf_key(&self, key: i64) -> bool {
        debug_assert!(self.is_leaf());
        let cells = self.sv.cells();
        match cells.first() {
            None => true,
            Some(first) => {
                if key < first.key {
                    return false;
                }
                match self.right_sibling() {
                    Some(_) => key <= cells.last().expect("non-empty").key,
                    None => true,
                }
            }
        }
    }
}
