//! Distributed B-tree operations (§4.5): lookup, insert, scan, and
//! delete-range, layered on the KV transaction runtime via a
//! [`ServerChannel`]. Each operation is its own short-lived transaction (or
//! a small sequence of them for a multi-leaf delete-range), matching
//! §4.5's "in a single KV transaction, add the cell."

use std::sync::RwLock;

use crate::coid::{make_oid, Coid};
use crate::config::Config;
use crate::error::{CResult, Error};
use crate::server::channel::ServerChannel;
use crate::value::{Cell, IntervalKind};

use super::node::Node;
use super::splitter::{SplitWork, Splitter, SplitterOptions};

/// Client-side retry cap for optimistic inserts and client-driven splits
/// (§4.5/§4.6's `SplitClientMaxRetries`). Not part of the wire-configured
/// option table (§6's `config.txt` schema lists only engine-wide
/// settings); kept as a B-tree-layer constant, matching the source
/// system's compile-time default.
pub const SPLIT_CLIENT_MAX_RETRIES: u32 = 100;

/// Bound on root-to-leaf descent depth (§4.5: "loop is bounded by
/// max-levels; exceeding it signals corruption"), matching the source
/// system's `DTREE_MAX_LEVELS` default.
const MAX_DEPTH: usize = 14;

/// B-tree-layer knobs that sit outside the server's wire-configured
/// `Config` (§6 lists only the engine-wide option table): whether a new
/// tree pre-allocates a sentinel first leaf (§4.5's "no first-node hack"),
/// and the splitter's duplicate-suppression behavior (§4.6).
#[derive(Clone, Debug)]
pub struct BTreeOptions {
    pub first_node_hack: bool,
    pub splitter: SplitterOptions,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        BTreeOptions { first_node_hack: true, splitter: SplitterOptions::default() }
    }
}

/// Caches the single most-recently-visited leaf coid (plus its immediate
/// parent, if it has one), so repeat lookups in the same neighborhood skip
/// the root descent (§4.5's "direct-seek optimization"). A hit is
/// re-validated against the cached leaf's own key range before use; a miss
/// or a stale entry falls back to root descent. Caching the parent
/// alongside the leaf keeps a cache-hit path just as usable for split
/// bookkeeping as a freshly-descended one.
struct DirectSeekCache {
    last: RwLock<Option<(Coid, Option<Coid>)>>,
}

impl DirectSeekCache {
    fn new() -> Self {
        DirectSeekCache { last: RwLock::new(None) }
    }

    fn get(&self) -> Option<(Coid, Option<Coid>)> {
        *self.last.read().expect("direct-seek cache lock poisoned")
    }

    fn set(&self, leaf: Coid, parent: Option<Coid>) {
        *self.last.write().expect("direct-seek cache lock poisoned") = Some((leaf, parent));
    }
}

/// A distributed B-tree rooted at a well-known coid (`Coid::root(cid)`).
pub struct BTree {
    pub root: Coid,
    pub config: Config,
    pub options: BTreeOptions,
    direct_seek: DirectSeekCache,
    pub splitter: Splitter,
}

impl BTree {
    pub fn new(cid: u64, config: Config, options: BTreeOptions) -> Self {
        let splitter = Splitter::new(options.splitter.clone());
        BTree { root: Coid::root(cid), config, options, direct_seek: DirectSeekCache::new(), splitter }
    }

    /// Initializes an empty tree: a lone leaf root, or (with
    /// `first_node_hack`) an internal root pointing at one sentinel leaf,
    /// per §4.5's "reduce split contention on empty trees."
    pub fn create(&self, channel: &dyn ServerChannel) -> CResult<()> {
        let mut tx = channel.begin_transaction(false);
        if self.options.first_node_hack {
            let leaf_coid = Coid::new(self.root.cid, make_oid(0, 2, 0));
            channel.write_super(&mut tx, leaf_coid, Node::empty_leaf(leaf_coid).sv)?;
            let mut root = Node::empty_internal(self.root);
            root.sv.insert_cell(Cell::internal(i64::MIN, leaf_coid));
            channel.write_super(&mut tx, self.root, root.sv)?;
        } else {
            channel.write_super(&mut tx, self.root, Node::empty_leaf(self.root).sv)?;
        }
        channel.commit(tx)?;
        Ok(())
    }

    /// Descends from `self.root` to the leaf covering `key`, returning the
    /// full ancestor path (root first, leaf last). Tries the direct-seek
    /// cache first; falls back to a full descent on a miss.
    fn find_leaf_path(&self, channel: &dyn ServerChannel, key: i64) -> CResult<Vec<Coid>> {
        if let Some((cached, parent)) = self.direct_seek.get() {
            let mut tx = channel.begin_transaction(true);
            let hit = channel.read_super(&mut tx, cached)?;
            channel.abort(tx);
            if let Some(sv) = hit {
                let node = Node::from_super_value(cached, sv);
                if node.is_leaf() && node.covers_leaf_key(key) {
                    let mut path = Vec::new();
                    if let Some(parent) = parent {
                        path.push(parent);
                    }
                    path.push(cached);
                    return Ok(path);
                }
            }
        }

        let mut tx = channel.begin_transaction(true);
        let mut path = vec![self.root];
        let mut current = self.root;
        for _ in 0..MAX_DEPTH {
            let sv = channel
                .read_super(&mut tx, current)?
                .ok_or_else(|| Error::Corruption(format!("missing b-tree node {current}")))?;
            let node = Node::from_super_value(current, sv);
            if node.is_leaf() {
                channel.abort(tx);
                let parent = if path.len() >= 2 { Some(path[path.len() - 2]) } else { None };
                self.direct_seek.set(current, parent);
                return Ok(path);
            }
            current = node.find_child(key)?;
            path.push(current);
        }
        channel.abort(tx);
        Err(Error::Corruption("b-tree descent exceeded max depth".into()))
    }

    /// §4.5 `Lookup(key)`.
    pub fn lookup(&self, channel: &dyn ServerChannel, key: i64) -> CResult<Option<Vec<u8>>> {
        let path = self.find_leaf_path(channel, key)?;
        let leaf_coid = *path.last().expect("path always has at least the root");
        let mut tx = channel.begin_transaction(true);
        let sv = channel.read_super(&mut tx, leaf_coid)?;
        channel.abort(tx);
        let node = match sv {
            Some(sv) => Node::from_super_value(leaf_coid, sv),
            None => return Ok(None),
        };
        Ok(node.sv.find_cell(key).map(|c| c.payload.clone()))
    }

    /// §4.5 `Insert(key, payload)`, including the optimistic-insert retry
    /// loop and (for `SplitLocation::Client`) the inline split.
    pub fn insert(&self, channel: &dyn ServerChannel, key: i64, payload: Vec<u8>) -> CResult<()> {
        let mut retries = 0;
        loop {
            let path = self.find_leaf_path(channel, key)?;
            let leaf_coid = *path.last().expect("path always has at least the root");
            let mut tx = channel.begin_transaction(false);
            channel.list_add(&mut tx, leaf_coid, Cell::leaf(key, payload.clone()))?;
            match channel.commit(tx) {
                Ok(outcome) => {
                    let parent = if path.len() >= 2 { Some(path[path.len() - 2]) } else { None };
                    self.direct_seek.set(leaf_coid, parent);
                    if outcome.work_list.contains(&leaf_coid) {
                        let work = SplitWork { node: leaf_coid, parent };
                        match self.config.split_location {
                            crate::config::SplitLocation::Server => self.splitter.enqueue(work),
                            crate::config::SplitLocation::Client => {
                                super::splitter::split_node(channel, &work)?;
                            }
                        }
                    }
                    return Ok(());
                }
                Err(Error::TransactionAbort(_)) if retries < SPLIT_CLIENT_MAX_RETRIES => {
                    retries += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// §4.5 `Scan(start_key, count)`: walks forward across leaf
    /// right-sibling pointers, collecting up to `count` cells at or after
    /// `start_key`. Restartable by calling again with a later `start_key`.
    pub fn scan(&self, channel: &dyn ServerChannel, start_key: i64, count: usize) -> CResult<Vec<(i64, Vec<u8>)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let path = self.find_leaf_path(channel, start_key)?;
        let mut leaf_coid = *path.last().expect("path always has at least the root");
        let mut results = Vec::new();
        let mut tx = channel.begin_transaction(true);
        loop {
            let sv = channel.read_super(&mut tx, leaf_coid)?;
            let node = match sv {
                Some(sv) => Node::from_super_value(leaf_coid, sv),
                None => break,
            };
            for cell in node.cells() {
                if cell.key >= start_key {
                    results.push((cell.key, cell.payload.clone()));
                    if results.len() == count {
                        channel.abort(tx);
                        return Ok(results);
                    }
                }
            }
            match node.right_sibling() {
                Some(sibling) => leaf_coid = sibling,
                None => break,
            }
        }
        channel.abort(tx);
        Ok(results)
    }

    /// §4.5 `Delete-range(lo, hi)`: one KV operation per covered leaf, in
    /// leaf order; deliberately does not rebalance underfull nodes.
    pub fn delete_range(&self, channel: &dyn ServerChannel, lo: i64, hi: i64, kind: IntervalKind) -> CResult<()> {
        let path = self.find_leaf_path(channel, lo)?;
        let mut leaf_coid = *path.last().expect("path always has at least the root");
        loop {
            let mut tx = channel.begin_transaction(true);
            let sv = channel.read_super(&mut tx, leaf_coid)?;
            channel.abort(tx);
            let node = match sv {
                Some(sv) => Node::from_super_value(leaf_coid, sv),
                None => break,
            };
            let next = node.right_sibling();
            let last_key = node.cells().last().map(|c| c.key);

            let mut tx = channel.begin_transaction(false);
            channel.list_del_range(&mut tx, leaf_coid, lo, hi, kind)?;
            channel.commit(tx)?;

            let done = match last_key {
                Some(last) => last >= hi,
                None => true,
            };
            if done {
                break;
            }
            match next {
                Some(sibling) => leaf_coid = sibling,
                None => break,
            }
        }
        Ok(())
    }
}
