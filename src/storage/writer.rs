//! Placement of dirty nodes and recycling of superseded ones.
//!
//! A commit hands the [`FreeListWriter`] the working root of every changed
//! table. [`FreeListWriter::write_dirty_nodes`] serializes the workspace nodes
//! into arena space, children first, so every inner node is written with the
//! final offsets of its children. [`FreeListWriter::release_superseded`] then
//! diffs the previous and new trees and frees every old node the new tree no
//! longer reaches, tagged with the new version.
use std::collections::HashSet;

use log::{trace, warn};

use super::{
    Offset, StorageError, Version,
    arena::{ArenaAllocator, FreeSpaceEntry},
    header::file::HEADER_SIZE,
    node::{ClusterNode, NodeHeader, NodeRef},
    source::Workspace,
};

#[derive(Debug, Clone, Copy)]
pub struct FreeListWriter {
    backdating: bool,
}

impl FreeListWriter {
    pub fn new(backdating: bool) -> Self {
        Self { backdating }
    }

    /// Places every dirty node reachable from `root` and returns the offset of
    /// the root. Each placed region is appended to `placed` so a failed commit
    /// can hand it back.
    pub fn write_dirty_nodes(
        &self,
        arena: &mut ArenaAllocator,
        workspace: &mut Workspace<'_>,
        root: NodeRef,
        version: Version,
        placed: &mut Vec<(Offset, u64)>,
    ) -> Result<Offset, StorageError> {
        let slot = match root {
            NodeRef::Stored(offset) => return Ok(offset),
            NodeRef::Dirty(slot) => slot,
        };

        let mut node = workspace.take(slot)?;
        if let ClusterNode::Inner(inner) = &mut node {
            for (_, child) in inner.children.iter_mut() {
                let offset = self.write_dirty_nodes(arena, workspace, *child, version, placed)?;
                *child = NodeRef::Stored(offset);
            }
        }
        node.set_version(version);

        let bytes = node.encode()?;
        let offset = arena.allocate(bytes.len() as u64)?;
        placed.push((offset, bytes.len() as u64));
        arena.write(offset, &bytes)?;

        trace!(
            "placed {} node of {} entries at {offset} for version {version}",
            if node.is_leaf() { "leaf" } else { "inner" },
            node.len()
        );
        Ok(offset)
    }

    /// Frees every node of the tree at `old_root` that the tree at `new_root`
    /// does not share, tagged with `version`.
    ///
    /// Nodes of the new tree carrying an older version were carried over
    /// unchanged, together with their whole subtree, so the walk never
    /// descends into them.
    pub fn release_superseded(
        &self,
        arena: &mut ArenaAllocator,
        old_root: Option<Offset>,
        new_root: Option<Offset>,
        version: Version,
    ) -> Result<Vec<FreeSpaceEntry>, StorageError> {
        let Some(old_root) = old_root else {
            return Ok(Vec::new());
        };

        let mut shared = HashSet::new();
        if let Some(new_root) = new_root {
            Self::collect_shared(arena, new_root, version, &mut shared, &mut HashSet::new())?;
        }

        let mut released = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![old_root];
        while let Some(offset) = stack.pop() {
            if shared.contains(&offset) {
                continue;
            }
            if !seen.insert(offset) {
                return Err(revisited(offset));
            }
            let header = NodeHeader::read(arena.tail(offset)?)?;
            if let ClusterNode::Inner(inner) = ClusterNode::decode(arena.tail(offset)?)? {
                for (_, child) in inner.children {
                    if let NodeRef::Stored(child) = child {
                        stack.push(child);
                    }
                }
            }

            let size = header.stored_len();
            arena.free(offset, size, version)?;
            released.push(FreeSpaceEntry {
                offset,
                size,
                version_released: version,
            });
        }

        if !released.is_empty() {
            trace!(
                "released {} superseded nodes at version {version}",
                released.len()
            );
        }
        Ok(released)
    }

    fn collect_shared(
        arena: &ArenaAllocator,
        offset: Offset,
        version: Version,
        shared: &mut HashSet<Offset>,
        seen: &mut HashSet<Offset>,
    ) -> Result<(), StorageError> {
        if !seen.insert(offset) {
            return Err(revisited(offset));
        }
        let header = NodeHeader::read(arena.tail(offset)?)?;
        if header.version < version {
            shared.insert(offset);
            return Ok(());
        }
        if let ClusterNode::Inner(inner) = ClusterNode::decode(arena.tail(offset)?)? {
            for (_, child) in inner.children {
                if let NodeRef::Stored(child) = child {
                    Self::collect_shared(arena, child, version, shared, seen)?;
                }
            }
        }
        Ok(())
    }

    /// Lists the region of every node reachable from `root` in an arena
    /// image, decoding (and so validating) each one on the way. A node reached
    /// twice means the image is damaged.
    pub fn reachable(
        image: &[u8],
        root: Offset,
        out: &mut Vec<(Offset, u64)>,
    ) -> Result<(), StorageError> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(offset) = stack.pop() {
            if !seen.insert(offset) {
                return Err(revisited(offset));
            }
            if offset < HEADER_SIZE as u64 || offset >= image.len() as u64 {
                return Err(StorageError::corrupted(format!(
                    "node offset {offset} outside of the arena (len {})",
                    image.len()
                )));
            }
            let bytes = &image[offset as usize..];
            let header = NodeHeader::read(bytes)?;
            if let ClusterNode::Inner(inner) = ClusterNode::decode(bytes)? {
                for (_, child) in inner.children {
                    if let NodeRef::Stored(child) = child {
                        stack.push(child);
                    }
                }
            }
            out.push((offset, header.stored_len()));
        }
        Ok(())
    }

    /// Promotes every pending entry no reader can reach anymore and returns
    /// how many there were.
    ///
    /// Without backdating an entry waits until every pinned version is newer
    /// than the one that released it. With backdating it only has to wait
    /// for pins inside its own lifetime.
    pub fn reclaim(
        &self,
        arena: &mut ArenaAllocator,
        oldest_reachable: Version,
        pinned: &[Version],
    ) -> usize {
        let backdated = if self.backdating {
            self.backdate(arena, oldest_reachable, pinned)
        } else {
            HashSet::new()
        };
        arena.reclaim_where(|entry| {
            entry.version_released < oldest_reachable || backdated.contains(&entry.offset)
        })
    }

    /// A region is readable from the version that placed it up to the version
    /// that released it. With no reader pinned in between it may as well have
    /// been released when it was created. Returns the offsets of such entries.
    fn backdate(
        &self,
        arena: &ArenaAllocator,
        oldest_reachable: Version,
        pinned: &[Version],
    ) -> HashSet<Offset> {
        let mut backdated = HashSet::new();
        for entry in arena.pending() {
            if entry.version_released < oldest_reachable {
                continue;
            }
            let created = match arena.tail(entry.offset).and_then(NodeHeader::read) {
                Ok(header) => header.version,
                Err(e) => {
                    warn!("cannot backdate free entry at {}: {e}", entry.offset);
                    continue;
                }
            };
            let released = entry.version_released;
            if created < released && !pinned.iter().any(|v| (created..released).contains(v)) {
                trace!(
                    "backdating free entry at {} from {released} to {created}",
                    entry.offset
                );
                backdated.insert(entry.offset);
            }
        }
        backdated
    }
}

fn revisited(offset: Offset) -> StorageError {
    StorageError::corrupted(format!("node at {offset} is reachable twice"))
}
