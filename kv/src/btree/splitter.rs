//! The B-tree splitter (§4.6): splits an over-full node into two, creating
//! a fresh coid for the right half and threading the parent's separator
//! cell (or, for a root split, rewriting the root as a new internal node
//! so its coid stays stable).
//!
//! Both the server-side and client-side variants described in §4.6 run
//! this same transaction; they differ only in who calls it and when:
//! [`BTree::insert`](super::ops::BTree::insert) calls `split_node` inline
//! for `SplitLocation::Client`, or hands the work to a [`Splitter`] queue
//! for `SplitLocation::Server`, whose queue a background task (or a test)
//! drains with [`Splitter::drive_pending`].

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::coid::Coid;
use crate::error::{CResult, Error};
use crate::server::channel::ServerChannel;
use crate::value::Cell;

use super::node::{Node, ATTR_IS_LEAF, SPLIT_MIN_SIZE};

/// One pending split: the over-full node and its parent (`None` if the
/// node is the tree's root).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitWork {
    pub node: Coid,
    pub parent: Option<Coid>,
}

/// Splitter-layer knobs, outside the wire-configured `Config` option table
/// for the same reason as [`super::ops::BTreeOptions`].
#[derive(Clone, Debug)]
pub struct SplitterOptions {
    pub avoid_duplicate_interval: Duration,
    pub all_splits_unconditional: bool,
}

impl Default for SplitterOptions {
    fn default() -> Self {
        SplitterOptions { avoid_duplicate_interval: Duration::from_millis(1000), all_splits_unconditional: false }
    }
}

/// Queue of pending splits plus the duplicate-suppression table (§4.6: "a
/// server coalesces identical split requests within `AvoidDuplicateInterval`
/// unless `AllSplitsUnconditional` is set").
pub struct Splitter {
    options: SplitterOptions,
    queue: Mutex<VecDeque<SplitWork>>,
    last_requested: Mutex<HashMap<Coid, Instant>>,
}

impl Splitter {
    pub fn new(options: SplitterOptions) -> Self {
        Splitter { options, queue: Mutex::new(VecDeque::new()), last_requested: Mutex::new(HashMap::new()) }
    }

    /// Enqueues a split request, unless an identical request for the same
    /// node was made within the suppression interval.
    pub fn enqueue(&self, work: SplitWork) {
        if !self.options.all_splits_unconditional {
            let mut last = self.last_requested.lock().expect("splitter lock poisoned");
            if let Some(requested_at) = last.get(&work.node) {
                if requested_at.elapsed() < self.options.avoid_duplicate_interval {
                    return;
                }
            }
            last.insert(work.node, Instant::now());
        }
        self.queue.lock().expect("splitter lock poisoned").push_back(work);
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().expect("splitter lock poisoned").len()
    }

    /// Drains the queue, performing each split in turn. A split that finds
    /// its node already gone or too small (concurrently split or emptied
    /// by a delete-range) is a silent no-op rather than an error.
    pub fn drive_pending(&self, channel: &dyn ServerChannel) -> CResult<()> {
        loop {
            let work = self.queue.lock().expect("splitter lock poisoned").pop_front();
            match work {
                Some(work) => split_node(channel, &work)?,
                None => return Ok(()),
            }
        }
    }
}

/// Performs one split transaction: reads `work.node`, halves its cells at
/// the median, and either threads the new right half into `work.parent`
/// or, if the node is the root, rewrites the root as a fresh internal node
/// over two freshly-coided children.
pub(crate) fn split_node(channel: &dyn ServerChannel, work: &SplitWork) -> CResult<()> {
    let mut tx = channel.begin_transaction(false);
    let sv = channel.read_super(&mut tx, work.node)?;
    let sv = match sv {
        Some(sv) => sv,
        None => {
            channel.abort(tx);
            return Ok(());
        }
    };
    let mut node = Node::from_super_value(work.node, sv);

    if node.len() < 2 * SPLIT_MIN_SIZE {
        channel.abort(tx);
        return Ok(());
    }

    let median_idx = node.len() / 2;
    let split_key = node.cells()[median_idx].key;
    let is_leaf = node.is_leaf();
    let old_right_sibling = node.right_sibling();

    let right_sv = node.sv.split_at(split_key);
    let right_coid = Coid::new(work.node.cid, channel.alloc_rowid(work.node.cid, work.node.oid.wrapping_add(1))?);
    let mut right_node = Node { coid: right_coid, sv: right_sv };
    right_node.sv.set_attr(ATTR_IS_LEAF, if is_leaf { 1 } else { 0 });
    if is_leaf {
        right_node.set_right_sibling(old_right_sibling);
    }

    match work.parent {
        Some(parent_coid) => {
            if is_leaf {
                node.set_right_sibling(Some(right_coid));
            }
            channel.write_super(&mut tx, work.node, node.sv)?;
            channel.write_super(&mut tx, right_coid, right_node.sv)?;

            let parent_sv = channel
                .read_super(&mut tx, parent_coid)?
                .ok_or_else(|| Error::Corruption(format!("missing parent node {parent_coid}")))?;
            let mut parent_node = Node::from_super_value(parent_coid, parent_sv);
            parent_node.sv.insert_cell(Cell::internal(split_key, right_coid));
            channel.write_super(&mut tx, parent_coid, parent_node.sv)?;
        }
        None => {
            // Root split: the root's coid must stay stable, so both halves
            // get fresh coids and the root is rewritten as a new internal
            // node pointing at them.
            if is_leaf {
                node.set_right_sibling(Some(right_coid));
            }
            let left_coid =
                Coid::new(work.node.cid, channel.alloc_rowid(work.node.cid, work.node.oid.wrapping_add(2))?);
            channel.write_super(&mut tx, left_coid, node.sv)?;
            channel.write_super(&mut tx, right_coid, right_node.sv)?;

            let mut new_root = Node::empty_internal(work.node);
            new_root.sv.insert_cell(Cell::internal(i64::MIN, left_coid));
            new_root.sv.insert_cell(Cell::internal(split_key, right_coid));
            channel.write_super(&mut tx, work.node, new_root.sv)?;
        }
    }

    channel.commit(tx)?;
    Ok(())
}
