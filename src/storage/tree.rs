//! Cluster tree: the primary per-table index.
//!
//! Leaves hold `(ObjectKey, values)` pairs in key order. Inner nodes hold one
//! `(max key, child)` pair per child, so the children partition the key space
//! contiguously and every separator is exactly the largest key below it.
//!
//! # Splits and merges
//!
//! A node that grows past `max_fanout` entries splits in two, the left half
//! keeping `ceil(n / 2)` entries; a root split adds a level. A non-root node
//! that drops below `min_fanout` merges with an adjacent sibling when both fit
//! in one node, otherwise the pair is rebalanced to equal halves. A root left
//! with a single child is replaced by that child.
//!
//! # Copy-on-write
//!
//! Mutations go through a [`NodeSink`]. Every node on the path from the root to
//! the touched leaf is checked out, which copies committed nodes into the
//! transaction's workspace. Committed nodes are never modified in place.
use std::{fmt::Write, ops::ControlFlow};

use super::{
    StorageError,
    keys::{ObjectKey, TableKey},
    node::{ClusterNode, InnerNode, NodeRef, Values},
    source::{NodeSink, NodeSource},
};
use crate::config::Fanout;

/// No well-formed tree gets this deep: even at the smallest fan-out it would
/// hold more keys than fit in 63 bits. Descending further means the nodes
/// form a cycle.
const MAX_HEIGHT: usize = 64;

fn check_depth(depth: usize, at: NodeRef) -> Result<(), StorageError> {
    if depth > MAX_HEIGHT {
        return Err(StorageError::corrupted(format!(
            "node {at} sits deeper than {MAX_HEIGHT} levels, the tree has a cycle"
        )));
    }
    Ok(())
}

/// Result of inserting below a node.
struct Placement {
    node: NodeRef,
    max: ObjectKey,
    split: Option<(ObjectKey, NodeRef)>,
}

/// Result of erasing below a node.
struct Removal {
    node: NodeRef,
    values: Values,
    max: Option<ObjectKey>,
    len: usize,
}

enum RootShape {
    Empty,
    Single(NodeRef),
    Settled,
}

#[derive(Debug)]
pub struct ClusterTree<S> {
    source: S,
    table: TableKey,
    root: Option<NodeRef>,
    size: u64,
    fanout: Fanout,
}

impl<S: NodeSource> ClusterTree<S> {
    pub fn new(
        source: S,
        table: TableKey,
        root: Option<NodeRef>,
        size: u64,
        fanout: Fanout,
    ) -> Self {
        Self {
            source,
            table,
            root,
            size,
            fanout,
        }
    }

    pub fn table(&self) -> TableKey {
        self.table
    }

    pub fn root(&self) -> Option<NodeRef> {
        self.root
    }

    /// Number of objects in the tree.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn into_parts(self) -> (Option<NodeRef>, u64) {
        (self.root, self.size)
    }

    pub fn get(&self, key: ObjectKey) -> Result<Values, StorageError> {
        self.find(key)?.ok_or(StorageError::KeyNotFound(key))
    }

    pub fn contains(&self, key: ObjectKey) -> Result<bool, StorageError> {
        Ok(self.find(key)?.is_some())
    }

    fn find(&self, key: ObjectKey) -> Result<Option<Values>, StorageError> {
        let Some(mut at) = self.root else {
            return Ok(None);
        };

        for depth in 1.. {
            check_depth(depth, at)?;
            let node = self.source.node(at)?;
            self.check_table(&node)?;
            match node.as_ref() {
                ClusterNode::Leaf(leaf) => {
                    return Ok(leaf
                        .entries
                        .binary_search_by_key(&key, |(k, _)| *k)
                        .ok()
                        .map(|pos| leaf.entries[pos].1.clone()));
                }
                ClusterNode::Inner(inner) => {
                    let idx = inner.children.partition_point(|(max, _)| *max < key);
                    match inner.children.get(idx) {
                        Some((_, child)) => at = *child,
                        None => return Ok(None),
                    }
                }
            }
        }
        Ok(None)
    }

    /// Visits every object in key order until the visitor breaks.
    pub fn iterate<F>(&self, mut visitor: F) -> Result<ControlFlow<()>, StorageError>
    where
        F: FnMut(ObjectKey, &[u8]) -> ControlFlow<()>,
    {
        match self.root {
            Some(root) => self.walk(root, 1, &mut visitor),
            None => Ok(ControlFlow::Continue(())),
        }
    }

    fn walk<F>(
        &self,
        at: NodeRef,
        depth: usize,
        visitor: &mut F,
    ) -> Result<ControlFlow<()>, StorageError>
    where
        F: FnMut(ObjectKey, &[u8]) -> ControlFlow<()>,
    {
        check_depth(depth, at)?;
        let node = self.source.node(at)?;
        self.check_table(&node)?;
        match node.as_ref() {
            ClusterNode::Leaf(leaf) => {
                for (key, values) in leaf.entries.iter() {
                    if visitor(*key, values).is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
            }
            ClusterNode::Inner(inner) => {
                for (_, child) in inner.children.iter() {
                    if self.walk(*child, depth + 1, visitor)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Number of levels, leaves included. An empty tree has height 0.
    pub fn height(&self) -> Result<usize, StorageError> {
        let mut height = 0;
        let mut next = self.root;
        while let Some(at) = next {
            height += 1;
            check_depth(height, at)?;
            next = match self.source.node(at)?.as_ref() {
                ClusterNode::Leaf(_) => None,
                ClusterNode::Inner(inner) => inner.children.first().map(|(_, child)| *child),
            };
        }
        Ok(height)
    }

    /// Entry counts of all leaves, in key order.
    pub fn leaf_occupancy(&self) -> Result<Vec<usize>, StorageError> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            self.collect_leaves(root, 1, &mut out)?;
        }
        Ok(out)
    }

    fn collect_leaves(
        &self,
        at: NodeRef,
        depth: usize,
        out: &mut Vec<usize>,
    ) -> Result<(), StorageError> {
        check_depth(depth, at)?;
        let node = self.source.node(at)?;
        match node.as_ref() {
            ClusterNode::Leaf(leaf) => out.push(leaf.entries.len()),
            ClusterNode::Inner(inner) => {
                for (_, child) in inner.children.iter() {
                    self.collect_leaves(*child, depth + 1, out)?;
                }
            }
        }
        Ok(())
    }

    /// Walks the whole tree and checks every structural invariant.
    pub fn verify(&self) -> Result<(), StorageError> {
        let Some(root) = self.root else {
            return match self.size {
                0 => Ok(()),
                size => Err(StorageError::corrupted(format!(
                    "empty tree reports {size} objects"
                ))),
            };
        };

        let mut leaf_depth = None;
        let mut count = 0;
        self.verify_node(root, 1, true, None, &mut leaf_depth, &mut count)?;
        if count != self.size {
            return Err(StorageError::corrupted(format!(
                "tree holds {count} objects but reports {}",
                self.size
            )));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        at: NodeRef,
        depth: usize,
        is_root: bool,
        lower: Option<ObjectKey>,
        leaf_depth: &mut Option<usize>,
        count: &mut u64,
    ) -> Result<Option<ObjectKey>, StorageError> {
        check_depth(depth, at)?;
        let node = self.source.node(at)?;
        self.check_table(&node)?;
        node.validate()?;

        let len = node.len();
        if len > self.fanout.max || (!is_root && len < self.fanout.min) {
            return Err(StorageError::corrupted(format!(
                "node {at} holds {len} entries outside [{}, {}]",
                self.fanout.min, self.fanout.max
            )));
        }
        if let (Some(lower), Some(first)) = (lower, node.keys().first()) {
            if *first <= lower {
                return Err(StorageError::corrupted(format!(
                    "node {at} starts at {first}, not above its left neighbour {lower}"
                )));
            }
        }

        match node.as_ref() {
            ClusterNode::Leaf(leaf) => {
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(StorageError::corrupted(format!(
                            "leaf {at} at depth {depth}, expected {expected}"
                        )));
                    }
                    Some(_) => {}
                }
                if is_root && leaf.entries.is_empty() {
                    return Err(StorageError::corrupted("empty root leaf"));
                }
                *count += leaf.entries.len() as u64;
            }
            ClusterNode::Inner(inner) => {
                if is_root && inner.children.len() < 2 {
                    return Err(StorageError::corrupted("inner root with a single child"));
                }
                let mut lower = lower;
                for (separator, child) in inner.children.iter() {
                    let max =
                        self.verify_node(*child, depth + 1, false, lower, leaf_depth, count)?;
                    if max != Some(*separator) {
                        return Err(StorageError::corrupted(format!(
                            "separator {separator} in {at} does not match child maximum"
                        )));
                    }
                    lower = Some(*separator);
                }
            }
        }
        Ok(node.max_key())
    }

    /// Indented dump of the tree, one line per node.
    pub fn structure(&self) -> Result<String, StorageError> {
        let mut out = String::default();
        match self.root {
            Some(root) => self.describe(root, 0, &mut out)?,
            None => out.push_str("(empty)\n"),
        }
        Ok(out)
    }

    fn describe(&self, at: NodeRef, depth: usize, out: &mut String) -> Result<(), StorageError> {
        check_depth(depth + 1, at)?;
        let node = self.source.node(at)?;
        let keys = node.keys();
        let range = match (keys.first(), keys.last()) {
            (Some(first), Some(last)) => format!("{first}..={last}"),
            _ => "-".to_string(),
        };
        let kind = if node.is_leaf() { "leaf" } else { "inner" };
        // writing into a String cannot fail
        let _ = writeln!(
            out,
            "{:indent$}{kind} {at} v{} [{range}] ({})",
            "",
            node.version(),
            node.len(),
            indent = depth * 2
        );

        if let ClusterNode::Inner(inner) = node.as_ref() {
            for (_, child) in inner.children.iter() {
                self.describe(*child, depth + 1, out)?;
            }
        }
        Ok(())
    }

    fn check_table(&self, node: &ClusterNode) -> Result<(), StorageError> {
        if node.table() != self.table {
            return Err(StorageError::corrupted(format!(
                "node of table {} found in tree of table {}",
                node.table(),
                self.table
            )));
        }
        Ok(())
    }
}

impl<S: NodeSink> ClusterTree<S> {
    /// Inserts a new object and returns the (working) root reference.
    pub fn insert(&mut self, key: ObjectKey, values: Values) -> Result<NodeRef, StorageError> {
        if !key.is_storable() {
            return Err(StorageError::InvalidKey(key));
        }
        if self.contains(key)? {
            return Err(StorageError::DuplicateKey(key));
        }

        let root = match self.root {
            Some(root) => {
                let placed = self.insert_into(root, 1, key, values)?;
                match placed.split {
                    Some((right_max, right)) => self.source.create(ClusterNode::inner(
                        self.table,
                        vec![(placed.max, placed.node), (right_max, right)],
                    )),
                    None => placed.node,
                }
            }
            None => self
                .source
                .create(ClusterNode::leaf(self.table, vec![(key, values)])),
        };

        self.root = Some(root);
        self.size += 1;
        Ok(root)
    }

    /// Removes an object and returns its values.
    pub fn erase(&mut self, key: ObjectKey) -> Result<Values, StorageError> {
        let Some(root) = self.root else {
            return Err(StorageError::KeyNotFound(key));
        };
        if !self.contains(key)? {
            return Err(StorageError::KeyNotFound(key));
        }

        let removal = self.erase_from(root, key)?;
        self.root = self.collapse_root(removal.node)?;
        self.size -= 1;
        Ok(removal.values)
    }

    fn insert_into(
        &mut self,
        at: NodeRef,
        depth: usize,
        key: ObjectKey,
        values: Values,
    ) -> Result<Placement, StorageError> {
        check_depth(depth, at)?;
        let (at, mut node) = self.source.checkout(at)?;
        if let Err(e) = self.insert_node(&mut node, depth, key, values) {
            self.source.checkin(at, node);
            return Err(e);
        }

        let split = if node.len() > self.fanout.max {
            let right = node.split_off(node.len().div_ceil(2));
            let right_max = right
                .max_key()
                .ok_or_else(|| StorageError::corrupted("split produced an empty node"))?;
            Some((right_max, self.source.create(right)))
        } else {
            None
        };
        let max = node.max_key();
        self.source.checkin(at, node);

        Ok(Placement {
            node: at,
            max: max.ok_or_else(|| StorageError::corrupted("node emptied by insert"))?,
            split,
        })
    }

    fn insert_node(
        &mut self,
        node: &mut ClusterNode,
        depth: usize,
        key: ObjectKey,
        values: Values,
    ) -> Result<(), StorageError> {
        self.check_table(node)?;
        match node {
            ClusterNode::Leaf(leaf) => {
                let pos = leaf.entries.partition_point(|(k, _)| *k < key);
                if leaf.entries.get(pos).is_some_and(|(k, _)| *k == key) {
                    return Err(StorageError::DuplicateKey(key));
                }
                leaf.entries.insert(pos, (key, values));
            }
            ClusterNode::Inner(inner) => {
                if inner.children.is_empty() {
                    return Err(StorageError::corrupted("inner node without children"));
                }
                // keys above every separator extend the last child
                let idx = inner
                    .children
                    .partition_point(|(max, _)| *max < key)
                    .min(inner.children.len() - 1);

                let placed = self.insert_into(inner.children[idx].1, depth + 1, key, values)?;
                inner.children[idx] = (placed.max, placed.node);
                if let Some(right) = placed.split {
                    inner.children.insert(idx + 1, right);
                }
            }
        }
        Ok(())
    }

    fn erase_from(&mut self, at: NodeRef, key: ObjectKey) -> Result<Removal, StorageError> {
        let (at, mut node) = self.source.checkout(at)?;
        match self.erase_node(&mut node, key) {
            Ok(values) => {
                let max = node.max_key();
                let len = node.len();
                self.source.checkin(at, node);
                Ok(Removal {
                    node: at,
                    values,
                    max,
                    len,
                })
            }
            Err(e) => {
                self.source.checkin(at, node);
                Err(e)
            }
        }
    }

    fn erase_node(&mut self, node: &mut ClusterNode, key: ObjectKey) -> Result<Values, StorageError> {
        self.check_table(node)?;
        match node {
            ClusterNode::Leaf(leaf) => {
                let pos = leaf
                    .entries
                    .binary_search_by_key(&key, |(k, _)| *k)
                    .map_err(|_| StorageError::KeyNotFound(key))?;
                Ok(leaf.entries.remove(pos).1)
            }
            ClusterNode::Inner(inner) => {
                let idx = inner.children.partition_point(|(max, _)| *max < key);
                let Some((_, child)) = inner.children.get(idx) else {
                    return Err(StorageError::KeyNotFound(key));
                };

                let removal = self.erase_from(*child, key)?;
                match removal.max {
                    Some(max) => inner.children[idx] = (max, removal.node),
                    None => {
                        self.source.retire(removal.node);
                        inner.children.remove(idx);
                        return Ok(removal.values);
                    }
                }
                if removal.len < self.fanout.min {
                    self.rebalance(inner, idx)?;
                }
                Ok(removal.values)
            }
        }
    }

    /// Restores occupancy of `inner.children[idx]` by merging it with a
    /// neighbour or evening out the pair.
    fn rebalance(&mut self, inner: &mut InnerNode, idx: usize) -> Result<(), StorageError> {
        if inner.children.len() < 2 {
            return Ok(());
        }
        let (left_idx, right_idx) = if idx > 0 { (idx - 1, idx) } else { (idx, idx + 1) };

        let (left_at, mut left) = self.source.checkout(inner.children[left_idx].1)?;
        let (right_at, right) = self.source.checkout(inner.children[right_idx].1)?;
        let total = left.len() + right.len();
        left.append(right)?;

        if total <= self.fanout.max {
            inner.children[left_idx] = (self.max_of(&left)?, left_at);
            inner.children.remove(right_idx);
            self.source.checkin(left_at, left);
            self.source.retire(right_at);
        } else {
            let right = left.split_off(total.div_ceil(2));
            inner.children[left_idx] = (self.max_of(&left)?, left_at);
            inner.children[right_idx] = (self.max_of(&right)?, right_at);
            self.source.checkin(left_at, left);
            self.source.checkin(right_at, right);
        }
        Ok(())
    }

    fn collapse_root(&mut self, root: NodeRef) -> Result<Option<NodeRef>, StorageError> {
        let mut at = root;
        loop {
            let shape = match self.source.node(at)?.as_ref() {
                ClusterNode::Leaf(leaf) if leaf.entries.is_empty() => RootShape::Empty,
                ClusterNode::Inner(inner) if inner.children.len() == 1 => {
                    RootShape::Single(inner.children[0].1)
                }
                _ => RootShape::Settled,
            };

            match shape {
                RootShape::Empty => {
                    self.source.retire(at);
                    return Ok(None);
                }
                RootShape::Single(child) => {
                    self.source.retire(at);
                    at = child;
                }
                RootShape::Settled => return Ok(Some(at)),
            }
        }
    }

    fn max_of(&self, node: &ClusterNode) -> Result<ObjectKey, StorageError> {
        node.max_key()
            .ok_or_else(|| StorageError::corrupted("rebalanced node is empty"))
    }
}
