//! Region allocator over the store's byte arena.
//!
//! The [`ArenaAllocator`] owns the in-memory image of the file: a growable byte
//! vector whose first [`HEADER_SIZE`] bytes are reserved for the file header.
//! Everything after that is carved into 8-byte aligned regions holding
//! serialized cluster nodes.
//!
//! # Free space
//!
//! Freed regions go through two stages:
//!
//! 1. [`ArenaAllocator::free`] records a [`FreeSpaceEntry`] tagged with the
//!    version whose commit made the region unreachable. The bytes stay intact
//!    because readers pinned to older versions may still decode them.
//! 2. [`ArenaAllocator::reclaim`] moves every entry released before the oldest
//!    reachable version onto the reusable free list, coalescing neighbours.
//!    [`ArenaAllocator::reclaim_where`] lets the caller pick entries itself.
//!    A free region touching the end of the arena shrinks the arena instead.
//!
//! The free list is indexed both by offset (for coalescing) and by size (for
//! best-fit allocation).
use std::collections::{BTreeMap, BTreeSet};

use log::{error, trace};

use super::{Offset, StorageError, Version, align, header::file::HEADER_SIZE};

/// A region that became unreachable at `version_released`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpaceEntry {
    pub offset: Offset,
    pub size: u64,
    pub version_released: Version,
}

#[derive(Debug)]
pub struct ArenaAllocator {
    bytes: Vec<u8>,
    max_size: u64,
    allocated: BTreeMap<Offset, u64>,
    free_by_offset: BTreeMap<Offset, u64>,
    free_by_size: BTreeSet<(u64, Offset)>,
    pending: Vec<FreeSpaceEntry>,
}

impl ArenaAllocator {
    /// Creates an arena holding only the reserved header.
    pub fn new(max_size: u64) -> Self {
        Self {
            bytes: vec![0; HEADER_SIZE],
            max_size,
            allocated: BTreeMap::new(),
            free_by_offset: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            pending: Vec::new(),
        }
    }

    /// Rebuilds an arena from a previously persisted image. `live` lists every
    /// region still referenced by the committed version; all gaps between them
    /// become free space.
    pub fn restore(
        bytes: Vec<u8>,
        max_size: u64,
        live: impl IntoIterator<Item = (Offset, u64)>,
    ) -> Result<Self, StorageError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StorageError::corrupted(format!(
                "arena image of {} bytes is shorter than its header",
                bytes.len()
            )));
        }

        let mut arena = Self {
            bytes,
            max_size,
            ..Self::new(max_size)
        };

        let mut cursor = HEADER_SIZE as u64;
        let live: BTreeMap<Offset, u64> = live.into_iter().collect();
        for (&offset, &size) in live.iter() {
            if offset < cursor || offset + size > arena.len() {
                return Err(StorageError::corrupted(format!(
                    "live region {offset}+{size} overlaps another region or the arena end"
                )));
            }
            if offset > cursor {
                arena.insert_free(cursor, offset - cursor);
            }
            cursor = offset + size;
        }
        if cursor < arena.len() {
            arena.insert_free(cursor, arena.len() - cursor);
        }
        arena.allocated = live;
        arena.trim_tail();

        Ok(arena)
    }

    /// Returns an offset to `size` bytes (rounded up to the alignment).
    ///
    /// Reuses the smallest free region that fits, otherwise grows the arena.
    pub fn allocate(&mut self, size: u64) -> Result<Offset, StorageError> {
        let size = align(size.max(1));

        let candidate = self.free_by_size.range((size, 0)..).next().copied();
        let offset = match candidate {
            Some((found, offset)) => {
                self.free_by_size.remove(&(found, offset));
                self.free_by_offset.remove(&offset);
                if found > size {
                    self.insert_free(offset + size, found - size);
                }
                offset
            }
            None => {
                let offset = self.len();
                let end = offset + size;
                if end > self.max_size {
                    return Err(StorageError::OutOfSpace {
                        requested: size,
                        limit: self.max_size,
                    });
                }
                self.bytes.resize(end as usize, 0);
                offset
            }
        };

        trace!("allocated {size} bytes at {offset}");
        self.allocated.insert(offset, size);
        Ok(offset)
    }

    /// Marks an allocated region as released at `version`. The bytes stay
    /// readable until a [`reclaim`](Self::reclaim) makes them reusable.
    pub fn free(&mut self, offset: Offset, size: u64, version: Version) -> Result<(), StorageError> {
        let size = self.take_allocated(offset, size)?;
        self.pending.push(FreeSpaceEntry {
            offset,
            size,
            version_released: version,
        });
        Ok(())
    }

    /// Returns a region straight to the free list. Only valid for regions no
    /// version ever referenced, such as nodes placed by a commit that failed.
    pub fn release_unpublished(&mut self, offset: Offset, size: u64) -> Result<(), StorageError> {
        let size = self.take_allocated(offset, size)?;
        self.insert_free(offset, size);
        self.trim_tail();
        Ok(())
    }

    /// Promotes every pending entry released before `oldest_reachable` to the
    /// free list. Returns how many entries were promoted.
    pub fn reclaim(&mut self, oldest_reachable: Version) -> usize {
        self.reclaim_where(|entry| entry.version_released < oldest_reachable)
    }

    /// Promotes every pending entry `ready` accepts. The caller vouches that
    /// no pinned version reaches those regions.
    pub fn reclaim_where<F>(&mut self, mut ready: F) -> usize
    where
        F: FnMut(&FreeSpaceEntry) -> bool,
    {
        let (promoted, waiting): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|entry| ready(entry));
        self.pending = waiting;

        for entry in promoted.iter() {
            self.insert_free(entry.offset, entry.size);
        }
        self.trim_tail();

        if !promoted.is_empty() {
            trace!("reclaimed {} regions", promoted.len());
        }
        promoted.len()
    }

    pub fn pending(&self) -> &[FreeSpaceEntry] {
        &self.pending
    }

    /// Free regions as `(offset, size)`, ordered by offset.
    pub fn free_regions(&self) -> Vec<(Offset, u64)> {
        self.free_by_offset
            .iter()
            .map(|(&offset, &size)| (offset, size))
            .collect()
    }

    pub fn is_allocated(&self, offset: Offset) -> bool {
        self.allocated.contains_key(&offset)
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.values().sum()
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_by_offset.values().sum()
    }

    /// Current arena length in bytes, header included.
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn write(&mut self, offset: Offset, data: &[u8]) -> Result<(), StorageError> {
        let region = self.region_mut(offset, data.len() as u64)?;
        region.copy_from_slice(data);
        Ok(())
    }

    /// Bytes from `offset` up to the end of the arena.
    pub fn tail(&self, offset: Offset) -> Result<&[u8], StorageError> {
        if offset < HEADER_SIZE as u64 || offset >= self.len() {
            return Err(StorageError::corrupted(format!(
                "offset {offset} outside of the arena (len {})",
                self.len()
            )));
        }
        Ok(&self.bytes[offset as usize..])
    }

    /// The whole arena, header bytes included.
    pub fn image(&self) -> &[u8] {
        &self.bytes
    }

    pub fn read(&self, offset: Offset, size: u64) -> Result<&[u8], StorageError> {
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= self.len())
            .ok_or(StorageError::InvalidOffset { offset, size })?;
        Ok(&self.bytes[offset as usize..end as usize])
    }

    fn region_mut(&mut self, offset: Offset, size: u64) -> Result<&mut [u8], StorageError> {
        match self.allocated.get(&offset) {
            Some(&allocated) if allocated >= size => {
                Ok(&mut self.bytes[offset as usize..(offset + size) as usize])
            }
            _ => Err(StorageError::InvalidOffset { offset, size }),
        }
    }

    fn take_allocated(&mut self, offset: Offset, size: u64) -> Result<u64, StorageError> {
        let size = align(size.max(1));
        match self.allocated.get(&offset) {
            Some(&allocated) if allocated == size => {
                self.allocated.remove(&offset);
                Ok(size)
            }
            _ => {
                error!("free of unallocated region {offset}+{size}");
                Err(StorageError::InvalidOffset { offset, size })
            }
        }
    }

    fn insert_free(&mut self, mut offset: Offset, mut size: u64) {
        // merge with the region ending right where this one starts
        if let Some((&prev, &prev_size)) = self.free_by_offset.range(..offset).next_back() {
            if prev + prev_size == offset {
                self.free_by_offset.remove(&prev);
                self.free_by_size.remove(&(prev_size, prev));
                offset = prev;
                size += prev_size;
            }
        }
        // and with the region starting right where this one ends
        if let Some(&next_size) = self.free_by_offset.get(&(offset + size)) {
            let next = offset + size;
            self.free_by_offset.remove(&next);
            self.free_by_size.remove(&(next_size, next));
            size += next_size;
        }

        self.free_by_offset.insert(offset, size);
        self.free_by_size.insert((size, offset));
    }

    fn trim_tail(&mut self) {
        let last = self.free_by_offset.iter().next_back().map(|(&o, &s)| (o, s));
        if let Some((offset, size)) = last {
            if offset + size == self.len() {
                self.free_by_offset.remove(&offset);
                self.free_by_size.remove(&(size, offset));
                self.bytes.truncate(offset as usize);
            }
        }
    }
}
