//! Node access for cluster trees.
//!
//! A [`ClusterTree`](super::tree::ClusterTree) never touches the arena
//! directly; it reads through a [`NodeSource`] and, when mutating, writes
//! through a [`NodeSink`]. Readers use an [`ArenaSource`] that decodes
//! committed nodes. Writers use a [`Workspace`], which copies a committed node
//! into a private slot the first time it is checked out and keeps every later
//! change there until commit.
use std::{borrow::Cow, sync::RwLock};

use log::trace;

use super::{
    Offset, StorageError,
    arena::ArenaAllocator,
    node::{ClusterNode, NodeHeader, NodeRef},
};

pub trait NodeSource {
    fn node(&self, at: NodeRef) -> Result<Cow<'_, ClusterNode>, StorageError>;
}

pub trait NodeSink: NodeSource {
    /// Takes a node out for mutation and returns the reference it must be
    /// checked back in under. Stored nodes are copied; the original is never
    /// modified.
    fn checkout(&mut self, at: NodeRef) -> Result<(NodeRef, ClusterNode), StorageError>;

    fn checkin(&mut self, at: NodeRef, node: ClusterNode);

    fn create(&mut self, node: ClusterNode) -> NodeRef;

    /// Drops a node that is no longer part of the tree.
    fn retire(&mut self, at: NodeRef);
}

impl<T: NodeSource + ?Sized> NodeSource for &T {
    fn node(&self, at: NodeRef) -> Result<Cow<'_, ClusterNode>, StorageError> {
        (**self).node(at)
    }
}

impl<T: NodeSource + ?Sized> NodeSource for &mut T {
    fn node(&self, at: NodeRef) -> Result<Cow<'_, ClusterNode>, StorageError> {
        (**self).node(at)
    }
}

impl<T: NodeSink + ?Sized> NodeSink for &mut T {
    fn checkout(&mut self, at: NodeRef) -> Result<(NodeRef, ClusterNode), StorageError> {
        (**self).checkout(at)
    }

    fn checkin(&mut self, at: NodeRef, node: ClusterNode) {
        (**self).checkin(at, node)
    }

    fn create(&mut self, node: ClusterNode) -> NodeRef {
        (**self).create(node)
    }

    fn retire(&mut self, at: NodeRef) {
        (**self).retire(at)
    }
}

/// Decodes committed nodes straight out of the arena.
#[derive(Debug, Clone, Copy)]
pub struct ArenaSource<'a> {
    arena: &'a RwLock<ArenaAllocator>,
}

impl<'a> ArenaSource<'a> {
    pub fn new(arena: &'a RwLock<ArenaAllocator>) -> Self {
        Self { arena }
    }

    pub fn load(&self, offset: Offset) -> Result<ClusterNode, StorageError> {
        let arena = self.arena.read()?;
        ClusterNode::decode(arena.tail(offset)?)
    }

    pub fn header(&self, offset: Offset) -> Result<NodeHeader, StorageError> {
        let arena = self.arena.read()?;
        NodeHeader::read(arena.tail(offset)?)
    }
}

impl NodeSource for ArenaSource<'_> {
    fn node(&self, at: NodeRef) -> Result<Cow<'_, ClusterNode>, StorageError> {
        match at {
            NodeRef::Stored(offset) => self.load(offset).map(Cow::Owned),
            NodeRef::Dirty(slot) => Err(StorageError::corrupted(format!(
                "committed tree references workspace slot {slot}"
            ))),
        }
    }
}

/// Private node copies of one write transaction.
#[derive(Debug)]
pub struct Workspace<'a> {
    arena: ArenaSource<'a>,
    slots: Vec<Option<ClusterNode>>,
}

impl<'a> Workspace<'a> {
    pub fn new(arena: &'a RwLock<ArenaAllocator>) -> Self {
        Self {
            arena: ArenaSource::new(arena),
            slots: Vec::new(),
        }
    }

    pub fn arena(&self) -> ArenaSource<'a> {
        self.arena
    }

    /// Number of live dirty nodes.
    pub fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Removes a dirty node for placement.
    pub(crate) fn take(&mut self, slot: usize) -> Result<ClusterNode, StorageError> {
        self.slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| StorageError::corrupted(format!("workspace slot {slot} is empty")))
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

impl NodeSource for Workspace<'_> {
    fn node(&self, at: NodeRef) -> Result<Cow<'_, ClusterNode>, StorageError> {
        match at {
            NodeRef::Stored(offset) => self.arena.load(offset).map(Cow::Owned),
            NodeRef::Dirty(slot) => self
                .slots
                .get(slot)
                .and_then(Option::as_ref)
                .map(Cow::Borrowed)
                .ok_or_else(|| {
                    StorageError::corrupted(format!("workspace slot {slot} is checked out"))
                }),
        }
    }
}

impl NodeSink for Workspace<'_> {
    fn checkout(&mut self, at: NodeRef) -> Result<(NodeRef, ClusterNode), StorageError> {
        match at {
            NodeRef::Stored(offset) => {
                let node = self.arena.load(offset)?;
                self.slots.push(None);
                let slot = self.slots.len() - 1;
                trace!("copied node @{offset} into workspace slot {slot}");
                Ok((NodeRef::Dirty(slot), node))
            }
            NodeRef::Dirty(slot) => Ok((at, self.take(slot)?)),
        }
    }

    fn checkin(&mut self, at: NodeRef, node: ClusterNode) {
        if let NodeRef::Dirty(slot) = at {
            if let Some(entry) = self.slots.get_mut(slot) {
                *entry = Some(node);
            }
        }
    }

    fn create(&mut self, node: ClusterNode) -> NodeRef {
        self.slots.push(Some(node));
        NodeRef::Dirty(self.slots.len() - 1)
    }

    fn retire(&mut self, at: NodeRef) {
        // stored nodes are released by the commit's tree diff
        if let NodeRef::Dirty(slot) = at {
            if let Some(entry) = self.slots.get_mut(slot) {
                *entry = None;
            }
        }
    }
}
