use std::fmt::Debug;

use tracing::trace;

use crate::error::{Error, Result};
use crate::serial::ArchiverKind;
use crate::translate::NodeRepr;

use node::{Arena, Child, Node, NodeId, SearchResult};

pub(crate) mod node;
mod skeleton;

/// Configuration for a [`SkeletonBtreeMap`].
#[derive(Debug, Clone, Copy)]
pub struct BtreeConfig {
    node_min: usize,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        BtreeConfig { node_min: 128 }
    }
}

impl BtreeConfig {
    /// Minimum number of entries per non-root node; nodes hold between
    /// `node_min` and `2 * node_min` entries.
    pub fn node_min(mut self, node_min: usize) -> BtreeConfig {
        self.node_min = node_min;
        self
    }
}

/// Ordered map backed by a B-tree whose subtrees can individually be
/// deflated into content-addressed ghosts and inflated back on demand.
///
/// The base map behaves like an ordered associative container; every
/// operation returns a `Result` because any descent may run into a ghost,
/// which is reported as [`Error::NotLoaded`] so the caller can inflate the
/// missing range and retry (or call [`SkeletonBtreeMap::inflate_key`],
/// which is that retry loop). The root node is always materialized.
pub struct SkeletonBtreeMap<K, V>
where
    K: Ord + Clone + Debug,
{
    pub(crate) arena: Arena<K, V>,
    pub(crate) root: NodeId,
    pub(crate) node_min: usize,
    pub(crate) archiver: Option<ArchiverKind<NodeRepr<K, V>>>,
}

enum Descent<K> {
    Value {
        node: NodeId,
    },
    Missing,
    Ghost {
        parent: NodeId,
        lkey: Option<K>,
        range: String,
    },
    Bare {
        node: NodeId,
        range: String,
    },
}

impl<K, V> SkeletonBtreeMap<K, V>
where
    K: Ord + Clone + Debug,
{
    /// Create an empty map with the given configuration.
    pub fn new(config: BtreeConfig) -> Result<SkeletonBtreeMap<K, V>> {
        if config.node_min < 2 {
            return Err(Error::NodeMinTooSmall(config.node_min));
        }
        let mut arena = Arena::new();
        let root = arena.alloc(Node::new_leaf(None, None));
        Ok(SkeletonBtreeMap {
            arena,
            root,
            node_min: config.node_min,
            archiver: None,
        })
    }

    /// Total number of entries, including entries inside ghost subtrees.
    pub fn len(&self) -> usize {
        self.arena[self.root].size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locate(&self, key: &K) -> Descent<K> {
        let mut id = self.root;
        loop {
            let node = &self.arena[id];
            if node.entries.is_bare() {
                return Descent::Bare {
                    node: id,
                    range: node.range(),
                };
            }
            match node.entries.search(key) {
                SearchResult::Found(_) => return Descent::Value { node: id },
                SearchResult::NotFound(i) => {
                    if node.leaf {
                        return Descent::Missing;
                    }
                    match &node.children[i] {
                        Child::Live(child) => id = *child,
                        Child::Ghost(g) => {
                            return Descent::Ghost {
                                parent: id,
                                lkey: g.lkey.clone(),
                                range: g.range(),
                            };
                        }
                    }
                }
            }
        }
    }

    /// Look up a key. Fails with [`Error::NotLoaded`] if the descent runs
    /// into a ghost or a deflated entries map.
    pub fn get(&self, key: &K) -> Result<Option<&V>> {
        match self.locate(key) {
            Descent::Value { node } => self.arena[node].entries.get(key),
            Descent::Missing => Ok(None),
            Descent::Ghost { range, .. } | Descent::Bare { range, .. } => {
                Err(Error::NotLoaded { range })
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert an entry, returning the previous value for the key if any.
    ///
    /// Only live nodes are mutated; a ghost on the descent path fails the
    /// whole operation with [`Error::NotLoaded`] before anything changes.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        let mut path: Vec<NodeId> = Vec::new();
        let mut id = self.root;
        let (leaf, idx) = loop {
            let node = &self.arena[id];
            if node.entries.is_bare() {
                return Err(Error::NotLoaded {
                    range: node.range(),
                });
            }
            match node.entries.search(&key) {
                SearchResult::Found(i) => {
                    let old = self.arena[id].entries.replace_value_at(i, value);
                    return Ok(Some(old));
                }
                SearchResult::NotFound(i) => {
                    if node.leaf {
                        break (id, i);
                    }
                    match &node.children[i] {
                        Child::Live(child) => {
                            path.push(id);
                            id = *child;
                        }
                        Child::Ghost(g) => {
                            return Err(Error::NotLoaded { range: g.range() });
                        }
                    }
                }
            }
        };

        self.arena[leaf].entries.insert_at(idx, key, value);
        self.arena[leaf].size += 1;
        for ancestor in &path {
            self.arena[*ancestor].size += 1;
        }
        self.split_overfull(leaf, path);
        Ok(None)
    }

    /// Remove a key, returning its value.
    ///
    /// The removal is planned read-only first: if any node, sibling, or
    /// boundary spine that the rebalancing would touch is not loaded, the
    /// operation fails with [`Error::NotLoaded`] and the tree is left
    /// untouched.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        match self.plan_remove(key)? {
            None => Ok(None),
            Some(plan) => Ok(Some(self.apply_remove(plan))),
        }
    }

    /// In-order iterator over all entries. Yields [`Error::NotLoaded`] and
    /// stops if it reaches a ghost subtree or deflated entries.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            map: self,
            stack: vec![Frame::Expand(self.root)],
            done: false,
        }
    }

    // ------------------------------------------------------------------
    // rebalancing
    // ------------------------------------------------------------------

    pub(crate) fn recompute_size(&mut self, id: NodeId) {
        let total = {
            let node = &self.arena[id];
            node.entries.len()
                + node
                    .children
                    .iter()
                    .map(|c| self.arena.subtree_size(c))
                    .sum::<usize>()
        };
        self.arena[id].size = total;
    }

    pub(crate) fn reparent_ghosts(&mut self, id: NodeId) {
        let node = &mut self.arena[id];
        let mut ghosts = 0;
        for child in node.children.iter_mut() {
            if let Child::Ghost(g) = child {
                g.parent = id;
                ghosts += 1;
            }
        }
        node.ghosts = ghosts;
    }

    fn split_overfull(&mut self, mut id: NodeId, mut path: Vec<NodeId>) {
        while self.arena[id].entries.len() > 2 * self.node_min {
            match path.pop() {
                Some(parent) => {
                    let idx = self.index_of_child(parent, id);
                    self.split_child(parent, idx);
                    id = parent;
                }
                None => {
                    self.split_root();
                    return;
                }
            }
        }
    }

    fn index_of_child(&self, parent: NodeId, child: NodeId) -> usize {
        self.arena[parent]
            .children
            .iter()
            .position(|c| c.live_id() == Some(child))
            .expect("child is not attached to this parent")
    }

    /// Split the overfull child at `idx`, pushing the median entry up.
    fn split_child(&mut self, parent: NodeId, idx: usize) {
        let child_id = self.arena[parent].children[idx]
            .live_id()
            .expect("cannot split a ghost child");
        let (sep, right_id) = self.split_node(child_id);
        let parent_node = &mut self.arena[parent];
        parent_node.entries.insert_at(idx, sep.0, sep.1);
        parent_node.children.insert(idx + 1, Child::Live(right_id));
    }

    fn split_root(&mut self) {
        trace!(root = ?self.root, "splitting root, tree grows by one level");
        let old_root = self.root;
        let new_root_id = self.arena.alloc(Node::new_branch(None, None));
        self.arena[new_root_id].children.push(Child::Live(old_root));
        self.root = new_root_id;
        self.split_child(new_root_id, 0);
        self.recompute_size(new_root_id);
    }

    /// Split a node with `2 * node_min + 1` entries around its median,
    /// returning the median entry and the id of the new right node.
    fn split_node(&mut self, id: NodeId) -> ((K, V), NodeId) {
        let node_min = self.node_min;
        let (sep, right_entries, right_children, lkey, rkey, leaf) = {
            let node = &mut self.arena[id];
            let (sep, right_entries) = node.entries.split_at_rank(node_min);
            let right_children = if node.leaf {
                Vec::new()
            } else {
                node.children.split_off(node_min + 1)
            };
            let rkey = node.rkey.clone();
            node.rkey = Some(sep.0.clone());
            let lkey = Some(sep.0.clone());
            (sep, right_entries, right_children, lkey, rkey, node.leaf)
        };
        let right = Node {
            lkey,
            rkey,
            leaf,
            entries: right_entries,
            children: right_children,
            ghosts: 0,
            size: 0,
        };
        let right_id = self.arena.alloc(right);
        self.reparent_ghosts(right_id);
        self.reparent_ghosts(id);
        self.recompute_size(id);
        self.recompute_size(right_id);
        (sep, right_id)
    }

    // ------------------------------------------------------------------
    // removal
    // ------------------------------------------------------------------

    fn plan_remove(&self, key: &K) -> Result<Option<RemovePlan>> {
        let mut path: Vec<PathStep> = Vec::new();
        let mut id = self.root;

        // Descend to the key.
        let target = loop {
            let node = &self.arena[id];
            if node.entries.is_bare() {
                return Err(Error::NotLoaded {
                    range: node.range(),
                });
            }
            match node.entries.search(key) {
                SearchResult::Found(i) => break (id, i),
                SearchResult::NotFound(i) => {
                    if node.leaf {
                        return Ok(None);
                    }
                    match &node.children[i] {
                        Child::Live(child) => {
                            path.push(PathStep { id, child_idx: i });
                            id = *child;
                        }
                        Child::Ghost(g) => {
                            return Err(Error::NotLoaded { range: g.range() });
                        }
                    }
                }
            }
        };

        let (target_id, entry_idx) = target;
        let swap;
        let leaf;
        if self.arena[target_id].leaf {
            swap = None;
            leaf = target_id;
        } else {
            // Continue to the rightmost leaf of the child left of the
            // entry; its last entry becomes the replacement separator.
            let mut spine_id = target_id;
            let mut child_idx = entry_idx;
            loop {
                let node = &self.arena[spine_id];
                match &node.children[child_idx] {
                    Child::Live(child) => {
                        path.push(PathStep {
                            id: spine_id,
                            child_idx,
                        });
                        spine_id = *child;
                    }
                    Child::Ghost(g) => {
                        return Err(Error::NotLoaded { range: g.range() });
                    }
                }
                let node = &self.arena[spine_id];
                if node.entries.is_bare() {
                    return Err(Error::NotLoaded {
                        range: node.range(),
                    });
                }
                if node.leaf {
                    break;
                }
                child_idx = node.child_count() - 1;
            }
            leaf = spine_id;

            // The subtree right of the entry keeps the entry's key as its
            // left boundary on its whole left spine; renaming that boundary
            // requires the spine to be loaded.
            let mut lspine = Vec::new();
            let mut slot = &self.arena[target_id].children[entry_idx + 1];
            loop {
                match slot {
                    Child::Ghost(g) => {
                        return Err(Error::NotLoaded { range: g.range() });
                    }
                    Child::Live(child) => {
                        lspine.push(*child);
                        let node = &self.arena[*child];
                        if node.leaf {
                            break;
                        }
                        slot = &node.children[0];
                    }
                }
            }
            swap = Some(SwapStep {
                node: target_id,
                entry_idx,
                lspine,
            });
        }

        // Pre-validate the underflow cascade: every sibling a rotation or
        // merge might consult must be loaded.
        self.plan_underflow(leaf, &path)?;

        Ok(Some(RemovePlan {
            path,
            leaf,
            target: (target_id, entry_idx),
            swap,
        }))
    }

    fn plan_underflow(&self, leaf: NodeId, path: &[PathStep]) -> Result<()> {
        let mut affected = leaf;
        for step in path.iter().rev() {
            let node = &self.arena[affected];
            if node.entries.len() > self.node_min {
                return Ok(());
            }
            // `affected` will underflow; a sibling must be able to help.
            let parent = &self.arena[step.id];
            let j = step.child_idx;
            let mut can_rotate = false;
            let mut can_merge = false;
            let mut ghost_range = None;
            let mut inspect = |slot: &Child<K>| match slot {
                Child::Live(sid) => {
                    let sib = &self.arena[*sid];
                    if sib.entries.is_live() {
                        if sib.entries.len() > self.node_min {
                            can_rotate = true;
                        } else {
                            can_merge = true;
                        }
                    }
                }
                Child::Ghost(g) => {
                    ghost_range = Some(g.range());
                }
            };
            if j > 0 {
                inspect(&parent.children[j - 1]);
            }
            if j + 1 < parent.child_count() {
                inspect(&parent.children[j + 1]);
            }
            if can_rotate {
                return Ok(());
            }
            if !can_merge {
                return Err(Error::NotLoaded {
                    range: ghost_range.unwrap_or_else(|| parent.range()),
                });
            }
            // A merge removes one entry from the parent; the cascade may
            // continue there.
            affected = step.id;
        }
        Ok(())
    }

    fn apply_remove(&mut self, plan: RemovePlan) -> V {
        let RemovePlan {
            path,
            leaf,
            target,
            swap,
        } = plan;

        let removed = match swap {
            None => {
                let (_, v) = self.arena[leaf].entries.remove_at(target.1);
                v
            }
            Some(SwapStep {
                node,
                entry_idx,
                lspine,
            }) => {
                let (sep_key, sep_value) = self.arena[leaf].entries.take_last();
                let (_, old_value) =
                    self.arena[node]
                        .entries
                        .replace_at(entry_idx, sep_key.clone(), sep_value);
                // Rename the boundary on both spines adjacent to the
                // replaced entry.
                let node_pos = path
                    .iter()
                    .position(|s| s.id == node)
                    .expect("swap node missing from path");
                for step in &path[node_pos + 1..] {
                    self.arena[step.id].rkey = Some(sep_key.clone());
                }
                self.arena[leaf].rkey = Some(sep_key.clone());
                for spine_id in lspine {
                    self.arena[spine_id].lkey = Some(sep_key.clone());
                }
                old_value
            }
        };

        self.arena[leaf].size -= 1;
        for step in &path {
            self.arena[step.id].size -= 1;
        }

        self.fix_underflow(leaf, path);
        self.collapse_root();
        removed
    }

    fn fix_underflow(&mut self, mut id: NodeId, mut path: Vec<PathStep>) {
        while self.arena[id].entries.len() < self.node_min {
            let step = match path.pop() {
                // The root may hold fewer than `node_min` entries.
                None => return,
                Some(step) => step,
            };
            let parent = step.id;
            let j = step.child_idx;

            let left_can_give = j > 0 && self.sibling_len(parent, j - 1) > Some(self.node_min);
            let right_can_give = j + 1 < self.arena[parent].child_count()
                && self.sibling_len(parent, j + 1) > Some(self.node_min);

            if left_can_give {
                self.rotate_right(parent, j);
                return;
            }
            if right_can_give {
                self.rotate_left(parent, j);
                return;
            }

            let left_live = j > 0 && self.sibling_len(parent, j - 1).is_some();
            if left_live {
                self.merge_children(parent, j - 1);
            } else {
                self.merge_children(parent, j);
            }
            id = parent;
        }
    }

    /// Entry count of a sibling usable for rebalancing: live with loaded
    /// entries. `None` for ghosts and bare nodes, matching what
    /// `plan_underflow` accepted.
    fn sibling_len(&self, parent: NodeId, idx: usize) -> Option<usize> {
        self.arena[parent].children[idx]
            .live_id()
            .filter(|id| self.arena[*id].entries.is_live())
            .map(|id| self.arena[id].entries.len())
    }

    /// Move the last entry of the left sibling through the parent into the
    /// underfull child at `j`.
    fn rotate_right(&mut self, parent: NodeId, j: usize) {
        let left_id = self.arena[parent].children[j - 1]
            .live_id()
            .expect("rotation sibling must be live");
        let child_id = self.arena[parent].children[j]
            .live_id()
            .expect("rotation target must be live");

        let (sib_key, sib_value, moved_child) = {
            let left = &mut self.arena[left_id];
            let (k, v) = left.entries.take_last();
            let moved = if left.leaf {
                None
            } else {
                left.children.pop()
            };
            left.rkey = Some(k.clone());
            (k, v, moved)
        };
        let (parent_key, parent_value) =
            self.arena[parent]
                .entries
                .replace_at(j - 1, sib_key.clone(), sib_value);

        let child = &mut self.arena[child_id];
        child.entries.insert_at(0, parent_key, parent_value);
        child.lkey = Some(sib_key);
        if let Some(slot) = moved_child {
            child.children.insert(0, slot);
        }
        self.reparent_ghosts(child_id);
        self.reparent_ghosts(left_id);
        self.recompute_size(child_id);
        self.recompute_size(left_id);
    }

    /// Move the first entry of the right sibling through the parent into
    /// the underfull child at `j`.
    fn rotate_left(&mut self, parent: NodeId, j: usize) {
        let right_id = self.arena[parent].children[j + 1]
            .live_id()
            .expect("rotation sibling must be live");
        let child_id = self.arena[parent].children[j]
            .live_id()
            .expect("rotation target must be live");

        let (sib_key, sib_value, moved_child) = {
            let right = &mut self.arena[right_id];
            let (k, v) = right.entries.take_first();
            let moved = if right.leaf {
                None
            } else {
                Some(right.children.remove(0))
            };
            right.lkey = Some(k.clone());
            (k, v, moved)
        };
        let (parent_key, parent_value) =
            self.arena[parent]
                .entries
                .replace_at(j, sib_key.clone(), sib_value);

        let child = &mut self.arena[child_id];
        let at = child.entries.len();
        child.entries.insert_at(at, parent_key, parent_value);
        child.rkey = Some(sib_key);
        if let Some(slot) = moved_child {
            child.children.push(slot);
        }
        self.reparent_ghosts(child_id);
        self.reparent_ghosts(right_id);
        self.recompute_size(child_id);
        self.recompute_size(right_id);
    }

    /// Merge the children at `left_idx` and `left_idx + 1`, pulling the
    /// separating entry down. The parent loses one entry and one child.
    fn merge_children(&mut self, parent: NodeId, left_idx: usize) {
        let left_id = self.arena[parent].children[left_idx]
            .live_id()
            .expect("merge target must be live");
        let (sep_key, sep_value) = self.arena[parent].entries.remove_at(left_idx);
        let right_slot = self.arena[parent].children.remove(left_idx + 1);
        let right_id = right_slot.live_id().expect("merge sibling must be live");
        let right = self.arena.take(right_id);

        let left = &mut self.arena[left_id];
        left.entries.merge((sep_key, sep_value), right.entries);
        left.rkey = right.rkey;
        left.size += 1 + right.size;
        for child in right.children {
            left.children.push(child);
        }
        self.reparent_ghosts(left_id);
    }

    fn collapse_root(&mut self) {
        while self.arena[self.root].entries.is_empty() && !self.arena[self.root].leaf {
            let only = self.arena[self.root].children[0]
                .live_id()
                .expect("collapsing root with a ghost child");
            trace!(root = ?self.root, "root is empty, tree shrinks by one level");
            self.arena.take(self.root);
            self.root = only;
            debug_assert!(self.arena[only].lkey.is_none() && self.arena[only].rkey.is_none());
        }
    }
}

struct PathStep {
    id: NodeId,
    child_idx: usize,
}

struct RemovePlan {
    path: Vec<PathStep>,
    leaf: NodeId,
    target: (NodeId, usize),
    swap: Option<SwapStep>,
}

struct SwapStep {
    node: NodeId,
    entry_idx: usize,
    lspine: Vec<NodeId>,
}

enum Frame {
    Expand(NodeId),
    Slot { node: NodeId, idx: usize },
    Entry { node: NodeId, idx: usize },
}

/// In-order iterator driven by an explicit stack of node frames.
pub struct Iter<'a, K, V>
where
    K: Ord + Clone + Debug,
{
    map: &'a SkeletonBtreeMap<K, V>,
    stack: Vec<Frame>,
    done: bool,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Ord + Clone + Debug,
{
    type Item = Result<(&'a K, &'a V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::Expand(id) => {
                    let node = &self.map.arena[id];
                    if node.entries.is_bare() {
                        self.done = true;
                        return Some(Err(Error::NotLoaded {
                            range: node.range(),
                        }));
                    }
                    // Push interleaved child and entry frames in reverse so
                    // the leftmost pops first.
                    if node.leaf {
                        for idx in (0..node.entries.len()).rev() {
                            self.stack.push(Frame::Entry { node: id, idx });
                        }
                    } else {
                        for idx in (0..node.child_count()).rev() {
                            if idx < node.entries.len() {
                                self.stack.push(Frame::Entry { node: id, idx });
                            }
                            self.stack.push(Frame::Slot { node: id, idx });
                        }
                    }
                }
                Frame::Slot { node, idx } => match &self.map.arena[node].children[idx] {
                    Child::Live(child) => self.stack.push(Frame::Expand(*child)),
                    Child::Ghost(g) => {
                        self.done = true;
                        return Some(Err(Error::NotLoaded { range: g.range() }));
                    }
                },
                Frame::Entry { node, idx } => {
                    let entries = &self.map.arena[node].entries;
                    return Some(Ok((entries.key_at(idx), entries.value_at(idx))));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests;
