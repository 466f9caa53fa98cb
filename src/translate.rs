//! Translators between live tree structures and their serializable wire
//! forms.
//!
//! A bare node maps to a [`NodeRepr`]: its boundaries, its local entries,
//! and (for branches) the ordered list of `(meta, size)` pairs describing
//! its ghost children. The whole tree maps to a [`TreeRepr`] carrying the
//! shell parameters plus the root's fields. Both directions are pure, and
//! `rev(app(x))` reproduces the node structurally.

use std::cmp::Ordering;
use std::fmt::Debug;

use serde_derive::{Deserialize, Serialize};

use crate::btree::node::{verify_node, Child, EntriesMap, GhostNode, Node, NodeId};
use crate::btree::{BtreeConfig, SkeletonBtreeMap};
use crate::error::{Error, Result};
use crate::serial::Meta;

/// A pure, total pair of conversions between a domain value and its
/// serializable representation.
pub trait Translator<T, U> {
    fn app(&self, value: &T) -> Result<U>;
    fn rev(&self, repr: U) -> Result<T>;
}

/// Wire form of one bare node.
///
/// `subnodes` is present exactly for branch nodes and lists each child's
/// storage handle with its cached subtree size, leftmost first. A list is
/// used instead of a map so that two identical content-addressed children
/// keep their own slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRepr<K, V> {
    pub lkey: Option<K>,
    pub rkey: Option<K>,
    pub entries: Vec<(K, V)>,
    pub subnodes: Option<Vec<(Meta, u64)>>,
}

// Reprs order by their left boundary (`None` = −∞), which is the node's
// position in an in-order traversal; the payload does not participate.
impl<K: Ord, V> Ord for NodeRepr<K, V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lkey.cmp(&other.lkey)
    }
}

impl<K: Ord, V> PartialOrd for NodeRepr<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, V> PartialEq for NodeRepr<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.lkey == other.lkey
    }
}

impl<K: Ord, V> Eq for NodeRepr<K, V> {}

/// Wire form of the tree shell: the fan-out parameter, the total entry
/// count, and the root node's own fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeRepr<K, V> {
    pub node_min: u64,
    pub size: u64,
    pub entries: Vec<(K, V)>,
    pub subnodes: Option<Vec<(Meta, u64)>>,
}

/// Converts bare nodes to and from [`NodeRepr`].
pub(crate) struct NodeTranslator {
    node_min: usize,
}

impl NodeTranslator {
    pub(crate) fn new(node_min: usize) -> NodeTranslator {
        NodeTranslator { node_min }
    }
}

impl<K, V> Translator<Node<K, V>, NodeRepr<K, V>> for NodeTranslator
where
    K: Ord + Clone + Debug,
    V: Clone,
{
    fn app(&self, node: &Node<K, V>) -> Result<NodeRepr<K, V>> {
        let bare = node.entries.is_bare() && (node.leaf || node.ghosts == node.child_count());
        if !bare {
            return Err(Error::IllegalState(format!(
                "cannot translate non-bare node {}",
                node.range()
            )));
        }
        let subnodes = if node.leaf {
            None
        } else {
            let mut subnodes = Vec::with_capacity(node.child_count());
            for child in &node.children {
                match child {
                    Child::Ghost(g) => subnodes.push((g.meta.clone(), g.size as u64)),
                    Child::Live(_) => {
                        return Err(Error::IllegalState(format!(
                            "bare node {} has a live child",
                            node.range()
                        )));
                    }
                }
            }
            Some(subnodes)
        };
        Ok(NodeRepr {
            lkey: node.lkey.clone(),
            rkey: node.rkey.clone(),
            entries: node.entries.pairs(),
            subnodes,
        })
    }

    fn rev(&self, repr: NodeRepr<K, V>) -> Result<Node<K, V>> {
        let leaf = repr.subnodes.is_none();
        let entries = EntriesMap::from_sorted(repr.entries)?;
        let mut node = Node {
            lkey: repr.lkey,
            rkey: repr.rkey,
            leaf,
            entries,
            children: Vec::new(),
            ghosts: 0,
            size: 0,
        };
        // The node arrives bare: serialized entries are marked deflated
        // until an inflate clears the flag.
        node.entries.deflate();

        if let Some(subnodes) = repr.subnodes {
            if subnodes.len() != node.entries.len() + 1 {
                return Err(Error::DataFormat(format!(
                    "node {} carries {} entries but {} subnodes",
                    node.range(),
                    node.entries.len(),
                    subnodes.len()
                )));
            }
            // Child slot boundaries are the node boundaries with every
            // entry key in between.
            let mut boundaries: Vec<Option<K>> = Vec::with_capacity(node.entries.len() + 2);
            boundaries.push(node.lkey.clone());
            for (k, _) in node.entries.iter() {
                boundaries.push(Some(k.clone()));
            }
            boundaries.push(node.rkey.clone());

            for (i, (meta, size)) in subnodes.into_iter().enumerate() {
                let size = usize::try_from(size)?;
                node.children.push(Child::Ghost(GhostNode {
                    lkey: boundaries[i].clone(),
                    rkey: boundaries[i + 1].clone(),
                    size,
                    parent: NodeId::DETACHED,
                    meta,
                }));
            }
            node.ghosts = node.children.len();
        }

        node.size = node.entries.len()
            + node
                .children
                .iter()
                .filter_map(|c| c.as_ghost().map(|g| g.size))
                .sum::<usize>();
        verify_node(&node, self.node_min)?;
        Ok(node)
    }
}

/// Converts a whole tree (with a bare root) to and from [`TreeRepr`].
pub struct TreeTranslator;

impl<K, V> Translator<SkeletonBtreeMap<K, V>, TreeRepr<K, V>> for TreeTranslator
where
    K: Ord + Clone + Debug,
    V: Clone,
{
    fn app(&self, tree: &SkeletonBtreeMap<K, V>) -> Result<TreeRepr<K, V>> {
        let root_repr = NodeTranslator::new(tree.node_min).app(&tree.arena[tree.root])?;
        Ok(TreeRepr {
            node_min: tree.node_min as u64,
            size: tree.len() as u64,
            entries: root_repr.entries,
            subnodes: root_repr.subnodes,
        })
    }

    fn rev(&self, repr: TreeRepr<K, V>) -> Result<SkeletonBtreeMap<K, V>> {
        let node_min = usize::try_from(repr.node_min)?;
        let size = usize::try_from(repr.size)?;
        let root = NodeTranslator::new(node_min).rev(NodeRepr {
            lkey: None,
            rkey: None,
            entries: repr.entries,
            subnodes: repr.subnodes,
        })?;
        if root.size != size {
            return Err(Error::DataFormat(format!(
                "mismatched sizes - tree: {}; root: {}",
                size, root.size
            )));
        }
        let mut tree = SkeletonBtreeMap::new(BtreeConfig::default().node_min(node_min))?;
        tree.arena[tree.root] = root;
        tree.reparent_ghosts(tree.root);
        Ok(tree)
    }
}
