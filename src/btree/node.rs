use std::fmt::Debug;
use std::ops::{Index, IndexMut};

use crate::error::{Error, Result};
use crate::serial::Meta;

/// Stable handle to a node slot in the tree's arena.
///
/// Handles stay valid across rebalancing; a slot is only reused after its
/// node was freed (deflated into a ghost or merged away).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct NodeId(pub(crate) usize);

impl NodeId {
    /// Placeholder for ghosts that are not attached to a parent yet, e.g.
    /// freshly rebuilt by a translator.
    pub(crate) const DETACHED: NodeId = NodeId(usize::MAX);
}

/// One child slot of a branch node: either a materialized node in the
/// arena or a ghost placeholder whose payload lives in the archiver.
pub(crate) enum Child<K> {
    Live(NodeId),
    Ghost(GhostNode<K>),
}

impl<K> Child<K> {
    pub(crate) fn is_ghost(&self) -> bool {
        matches!(self, Child::Ghost(_))
    }

    pub(crate) fn live_id(&self) -> Option<NodeId> {
        match self {
            Child::Live(id) => Some(*id),
            Child::Ghost(_) => None,
        }
    }

    pub(crate) fn as_ghost(&self) -> Option<&GhostNode<K>> {
        match self {
            Child::Live(_) => None,
            Child::Ghost(g) => Some(g),
        }
    }
}

/// Placeholder for an archived subtree.
///
/// Carries only the key range, the cached subtree entry count, the storage
/// handle, and a back-reference to the owning node. The back-reference is a
/// lookup handle, not ownership, and is maintained by the tree's `&mut`
/// methods whenever slots move between nodes (the single-writer contract).
pub(crate) struct GhostNode<K> {
    pub lkey: Option<K>,
    pub rkey: Option<K>,
    pub size: usize,
    pub parent: NodeId,
    pub meta: Meta,
}

impl<K: Debug> GhostNode<K> {
    pub(crate) fn range(&self) -> String {
        range_display(self.lkey.as_ref(), self.rkey.as_ref())
    }
}

pub(crate) fn range_display<K: Debug>(lkey: Option<&K>, rkey: Option<&K>) -> String {
    let l = lkey.map_or("-inf".to_string(), |k| format!("{:?}", k));
    let r = rkey.map_or("+inf".to_string(), |k| format!("{:?}", k));
    format!("[{}, {})", l, r)
}

/// `true` when `key` lies strictly above the lower boundary (`None` = −∞).
pub(crate) fn above_lower<K: Ord>(key: &K, lkey: Option<&K>) -> bool {
    lkey.map_or(true, |l| l < key)
}

/// `true` when `key` lies strictly below the upper boundary (`None` = +∞).
pub(crate) fn below_upper<K: Ord>(key: &K, rkey: Option<&K>) -> bool {
    rkey.map_or(true, |r| key < r)
}

pub(crate) fn bounds_eq<K: Ord>(a: Option<&K>, b: Option<&K>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

pub(crate) enum SearchResult {
    Found(usize),
    NotFound(usize),
}

/// The entries local to one node: parallel sorted key/value vectors plus a
/// deflated flag.
///
/// Deflating the map marks it bare without dropping the data; the entries
/// travel inside their node's serialized form. Value reads on a deflated
/// map signal not-loaded so a bare node cannot leak stale values.
pub(crate) struct EntriesMap<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
    deflated: bool,
}

impl<K, V> EntriesMap<K, V>
where
    K: Ord + Clone + Debug,
{
    pub(crate) fn new() -> EntriesMap<K, V> {
        EntriesMap {
            keys: Vec::new(),
            values: Vec::new(),
            deflated: false,
        }
    }

    /// Build from pairs that must already be strictly sorted by key.
    pub(crate) fn from_sorted(pairs: Vec<(K, V)>) -> Result<EntriesMap<K, V>> {
        let mut map = EntriesMap::new();
        for (k, v) in pairs {
            if let Some(last) = map.keys.last() {
                if *last >= k {
                    return Err(Error::DataFormat(format!(
                        "entries are not strictly sorted at key {:?}",
                        k
                    )));
                }
            }
            map.keys.push(k);
            map.values.push(v);
        }
        Ok(map)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub(crate) fn search(&self, key: &K) -> SearchResult {
        match self.keys.binary_search(key) {
            Ok(i) => SearchResult::Found(i),
            Err(i) => SearchResult::NotFound(i),
        }
    }

    pub(crate) fn key_at(&self, i: usize) -> &K {
        &self.keys[i]
    }

    pub(crate) fn value_at(&self, i: usize) -> &V {
        &self.values[i]
    }

    pub(crate) fn replace_value_at(&mut self, i: usize, value: V) -> V {
        std::mem::replace(&mut self.values[i], value)
    }

    pub(crate) fn replace_at(&mut self, i: usize, key: K, value: V) -> (K, V) {
        (
            std::mem::replace(&mut self.keys[i], key),
            std::mem::replace(&mut self.values[i], value),
        )
    }

    pub(crate) fn insert_at(&mut self, i: usize, key: K, value: V) {
        self.keys.insert(i, key);
        self.values.insert(i, value);
    }

    pub(crate) fn remove_at(&mut self, i: usize) -> (K, V) {
        (self.keys.remove(i), self.values.remove(i))
    }

    pub(crate) fn take_first(&mut self) -> (K, V) {
        self.remove_at(0)
    }

    pub(crate) fn take_last(&mut self) -> (K, V) {
        let i = self.keys.len() - 1;
        self.remove_at(i)
    }

    /// Split off everything right of rank `at`; the entry at `at` itself is
    /// removed and returned as the separator.
    pub(crate) fn split_at_rank(&mut self, at: usize) -> ((K, V), EntriesMap<K, V>) {
        let right_keys = self.keys.split_off(at + 1);
        let right_values = self.values.split_off(at + 1);
        let sep = (
            self.keys.pop().expect("split rank out of bounds"),
            self.values.pop().expect("split rank out of bounds"),
        );
        (
            sep,
            EntriesMap {
                keys: right_keys,
                values: right_values,
                deflated: false,
            },
        )
    }

    /// Concatenate `right` onto this map with `sep` in between.
    pub(crate) fn merge(&mut self, sep: (K, V), right: EntriesMap<K, V>) {
        self.keys.push(sep.0);
        self.values.push(sep.1);
        self.keys.extend(right.keys);
        self.values.extend(right.values);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.keys.iter().zip(self.values.iter())
    }

    /// Entries with keys strictly between the two bounds (`None` = ±∞).
    pub(crate) fn range_between<'a>(
        &'a self,
        lkey: Option<&'a K>,
        rkey: Option<&'a K>,
    ) -> impl Iterator<Item = (&'a K, &'a V)> {
        self.iter()
            .filter(move |(k, _)| above_lower(*k, lkey) && below_upper(*k, rkey))
    }

    pub(crate) fn get(&self, key: &K) -> Result<Option<&V>> {
        if self.deflated {
            return Err(Error::NotLoaded {
                range: "entries map is deflated".to_string(),
            });
        }
        match self.search(key) {
            SearchResult::Found(i) => Ok(Some(&self.values[i])),
            SearchResult::NotFound(_) => Ok(None),
        }
    }

    pub(crate) fn deflate(&mut self) {
        self.deflated = true;
    }

    pub(crate) fn inflate(&mut self) {
        self.deflated = false;
    }

    pub(crate) fn is_bare(&self) -> bool {
        self.deflated
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.deflated
    }
}

impl<K, V> EntriesMap<K, V>
where
    K: Ord + Clone + Debug,
    V: Clone,
{
    pub(crate) fn pairs(&self) -> Vec<(K, V)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// A materialized B-tree node.
///
/// The range `[lkey, rkey)` is half-open with `None` sentinels at the root;
/// boundary keys never appear as entries. A branch with `n` entries has
/// `n + 1` child slots, a leaf has none. The leaf flag never changes after
/// construction. `size` counts every entry in the subtree and `ghosts`
/// counts the immediate child slots currently ghosted.
pub(crate) struct Node<K, V> {
    pub lkey: Option<K>,
    pub rkey: Option<K>,
    pub leaf: bool,
    pub entries: EntriesMap<K, V>,
    pub children: Vec<Child<K>>,
    pub ghosts: usize,
    pub size: usize,
}

impl<K, V> Node<K, V>
where
    K: Ord + Clone + Debug,
{
    pub(crate) fn new_leaf(lkey: Option<K>, rkey: Option<K>) -> Node<K, V> {
        Node {
            lkey,
            rkey,
            leaf: true,
            entries: EntriesMap::new(),
            children: Vec::new(),
            ghosts: 0,
            size: 0,
        }
    }

    pub(crate) fn new_branch(lkey: Option<K>, rkey: Option<K>) -> Node<K, V> {
        Node {
            lkey,
            rkey,
            leaf: false,
            entries: EntriesMap::new(),
            children: Vec::new(),
            ghosts: 0,
            size: 0,
        }
    }

    pub(crate) fn range(&self) -> String {
        range_display(self.lkey.as_ref(), self.rkey.as_ref())
    }

    pub(crate) fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Index of the child immediately to the right of `key` (`None` = −∞,
    /// which selects the leftmost child). The child at the returned index
    /// covers the keys just above `key`.
    pub(crate) fn child_index_right_of(&self, key: Option<&K>) -> usize {
        match key {
            None => 0,
            Some(k) => match self.entries.search(k) {
                SearchResult::Found(i) => i + 1,
                SearchResult::NotFound(i) => i,
            },
        }
    }

    /// The `(lkey, rkey)` boundary pair of every child slot, left to right.
    pub(crate) fn key_pairs(&self) -> Vec<(Option<&K>, Option<&K>)> {
        let mut pairs = Vec::with_capacity(self.children.len());
        let mut left = self.lkey.as_ref();
        for i in 0..self.children.len() {
            let right = if i < self.entries.len() {
                Some(self.entries.key_at(i))
            } else {
                self.rkey.as_ref()
            };
            pairs.push((left, right));
            left = right;
        }
        pairs
    }
}

/// Slab of nodes with a free list; the tree addresses children through
/// [`NodeId`]s instead of pointers.
pub(crate) struct Arena<K, V> {
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
}

impl<K, V> Arena<K, V>
where
    K: Ord + Clone + Debug,
{
    pub(crate) fn new() -> Arena<K, V> {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn alloc(&mut self, node: Node<K, V>) -> NodeId {
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(node);
                NodeId(i)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    /// Remove and return a node, leaving its children untouched.
    pub(crate) fn take(&mut self, id: NodeId) -> Node<K, V> {
        let node = self.slots[id.0].take();
        self.free.push(id.0);
        match node {
            Some(n) => n,
            None => panic!("dangling node id {:?}", id),
        }
    }

    /// Free a whole subtree, post-order. Ghost slots carry no arena
    /// resources and are dropped with their parent.
    pub(crate) fn free_subtree(&mut self, id: NodeId) {
        let node = self.take(id);
        for child in node.children {
            if let Child::Live(child_id) = child {
                self.free_subtree(child_id);
            }
        }
    }

    pub(crate) fn subtree_size(&self, child: &Child<K>) -> usize {
        match child {
            Child::Live(id) => self[*id].size,
            Child::Ghost(g) => g.size,
        }
    }

    /// Number of live nodes currently allocated.
    pub(crate) fn live_nodes(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl<K, V> Index<NodeId> for Arena<K, V> {
    type Output = Node<K, V>;

    fn index(&self, id: NodeId) -> &Node<K, V> {
        match self.slots.get(id.0).and_then(|s| s.as_ref()) {
            Some(node) => node,
            None => panic!("dangling node id {:?}", id),
        }
    }
}

impl<K, V> IndexMut<NodeId> for Arena<K, V> {
    fn index_mut(&mut self, id: NodeId) -> &mut Node<K, V> {
        match self.slots.get_mut(id.0).and_then(|s| s.as_mut()) {
            Some(node) => node,
            None => panic!("dangling node id {:?}", id),
        }
    }
}

/// Structural integrity check for a single detached node: fan-out bound,
/// strict entry order inside the open range, child arity, boundary
/// contiguity of the child slots, and size consistency.
///
/// Violations are data-format errors because the check runs on nodes
/// rebuilt from external data.
pub(crate) fn verify_node<K, V>(node: &Node<K, V>, node_min: usize) -> Result<()>
where
    K: Ord + Clone + Debug,
{
    if node.entries.len() > 2 * node_min {
        return Err(Error::DataFormat(format!(
            "node {} has {} entries, maximum is {}",
            node.range(),
            node.entries.len(),
            2 * node_min
        )));
    }
    let in_range = node
        .entries
        .range_between(node.lkey.as_ref(), node.rkey.as_ref())
        .count();
    if in_range != node.entries.len() {
        return Err(Error::DataFormat(format!(
            "node {} has entries outside its open range",
            node.range()
        )));
    }
    let mut previous: Option<&K> = None;
    for (k, _) in node.entries.iter() {
        if let Some(p) = previous {
            if p >= k {
                return Err(Error::DataFormat(format!(
                    "node {} entries are not strictly increasing",
                    node.range()
                )));
            }
        }
        previous = Some(k);
    }

    if node.leaf {
        if !node.children.is_empty() {
            return Err(Error::DataFormat(format!(
                "leaf node {} has children",
                node.range()
            )));
        }
    } else {
        if node.entries.is_empty() {
            return Err(Error::DataFormat(format!(
                "branch node {} has no entries",
                node.range()
            )));
        }
        if node.children.len() != node.entries.len() + 1 {
            return Err(Error::DataFormat(format!(
                "node {} has {} entries but {} children",
                node.range(),
                node.entries.len(),
                node.children.len()
            )));
        }
        for (slot, (lkey, rkey)) in node.children.iter().zip(node.key_pairs()) {
            if let Child::Ghost(g) = slot {
                if !bounds_eq(g.lkey.as_ref(), lkey) || !bounds_eq(g.rkey.as_ref(), rkey) {
                    return Err(Error::DataFormat(format!(
                        "child {} does not line up with its slot {}",
                        g.range(),
                        range_display(lkey, rkey)
                    )));
                }
            }
        }
        let ghost_slots = node.children.iter().filter(|c| c.is_ghost()).count();
        if node.ghosts != ghost_slots {
            return Err(Error::DataFormat(format!(
                "node {} counts {} ghosts but has {} ghost slots",
                node.range(),
                node.ghosts,
                ghost_slots
            )));
        }
    }

    let ghost_total: usize = node
        .children
        .iter()
        .filter_map(|c| c.as_ghost().map(|g| g.size))
        .sum();
    if node.leaf || node.ghosts == node.children.len() {
        let expected = node.entries.len() + ghost_total;
        if node.size != expected {
            return Err(Error::DataFormat(format!(
                "node {} size {} does not match entries + children = {}",
                node.range(),
                node.size,
                expected
            )));
        }
    }

    Ok(())
}
