//! Versioned transactions over the arena.
//!
//! A [`VersionedStore`] publishes one [`Superblock`] per committed version.
//! Readers pin the superblock that was current when they began and decode
//! nodes straight from the arena; nothing they can reach is ever overwritten
//! or reused while they hold their pin. A single writer at a time copies the
//! nodes it touches into a private workspace and, on commit:
//!
//! 1. places every dirty node and the new table directory into the arena
//!    ([`FreeListWriter::write_dirty_nodes`]),
//! 2. flushes those regions and the new superblock to the backend,
//! 3. swaps the current superblock (the version becomes visible here),
//! 4. frees every node the new version no longer reaches
//!    ([`FreeListWriter::release_superseded`]) and the previous directory,
//! 5. reclaims free space no pinned version can reach anymore.
//!
//! A failure in steps 1 or 2 hands every placed region straight back to the
//! arena and leaves the store at its previous version.
//!
//! # Lock ordering
//!
//! The writer slot is taken first and held for the whole write transaction.
//! Inside a commit or reclaim pass the arena lock is taken before the tracker
//! lock. A commit holds the arena lock for steps 1 and 3 to 5 only; the
//! backend writes and syncs of step 2 run under the backend lock alone, so
//! readers keep decoding nodes meanwhile. Readers only ever take the tracker
//! lock briefly and the arena lock for reading.
use std::{
    collections::BTreeMap,
    ops::ControlFlow,
    path::Path,
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, error, info, warn};

use super::{
    Offset, StorageError, Version, align,
    arena::ArenaAllocator,
    backend::{FileBackend, MemoryBackend, StorageBackend},
    keys::{ObjectKey, TableKey},
    node::{NodeRef, Values},
    source::{ArenaSource, Workspace},
    superblock::{self, Superblock, TableState},
    tree::ClusterTree,
    writer::FreeListWriter,
};
use crate::config::{StoreConfig, WritePolicy};

/// Where the single writer slot stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Idle,
    Writing,
    Committing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub version: Version,
    pub oldest_reachable: Version,
    /// Open read handles.
    pub readers: usize,
    pub tables: usize,
    pub arena_len: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub pending_frees: usize,
    /// Arena bytes taken by the table directory of the current version.
    pub directory_bytes: u64,
}

#[derive(Debug)]
struct Durable<B> {
    backend: B,
    active: u8,
}

/// The published version and every version a reader still holds.
#[derive(Debug)]
struct Tracker {
    current: Arc<Superblock>,
    pins: BTreeMap<Version, usize>,
}

impl Tracker {
    fn pin(&mut self) -> Arc<Superblock> {
        *self.pins.entry(self.current.version).or_default() += 1;
        Arc::clone(&self.current)
    }

    fn unpin(&mut self, version: Version) {
        if let Some(count) = self.pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&version);
            }
        }
    }

    fn oldest_reachable(&self) -> Version {
        self.pins
            .keys()
            .next()
            .copied()
            .unwrap_or(self.current.version)
    }

    fn pinned(&self) -> Vec<Version> {
        self.pins.keys().copied().collect()
    }
}

#[derive(Debug)]
pub struct VersionedStore<B: StorageBackend = MemoryBackend> {
    config: StoreConfig,
    writer: FreeListWriter,
    arena: RwLock<ArenaAllocator>,
    durable: Mutex<Durable<B>>,
    tracker: Mutex<Tracker>,
    slot: Mutex<StoreState>,
    slot_released: Condvar,
    corrupted: AtomicBool,
}

impl VersionedStore<MemoryBackend> {
    pub fn in_memory(config: StoreConfig) -> Result<Self, StorageError> {
        Self::with_backend(MemoryBackend::new(), config)
    }
}

impl VersionedStore<FileBackend> {
    /// Opens the store file at `path`, creating it when missing.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StorageError> {
        let backend = FileBackend::open(path)?;
        Self::with_backend(backend, config)
    }
}

impl<B: StorageBackend> VersionedStore<B> {
    /// Loads the committed version held by `backend`, or formats an empty
    /// store when the backend holds nothing.
    pub fn with_backend(mut backend: B, config: StoreConfig) -> Result<Self, StorageError> {
        config.validate()?;

        let (active, block, arena) = match superblock::load(&mut backend)? {
            None => {
                let block = Superblock::default();
                let active = superblock::format(&mut backend, &block)?;
                (active, block, ArenaAllocator::new(config.max_arena_size))
            }
            Some((active, block)) => {
                let arena = Self::restore(&mut backend, &block, &config)?;
                info!(
                    "opened store at version {} with {} tables ({} bytes)",
                    block.version,
                    block.tables.len(),
                    arena.len()
                );
                (active, block, arena)
            }
        };

        Ok(Self {
            writer: FreeListWriter::new(config.backdating),
            config,
            arena: RwLock::new(arena),
            durable: Mutex::new(Durable { backend, active }),
            tracker: Mutex::new(Tracker {
                current: Arc::new(block),
                pins: BTreeMap::new(),
            }),
            slot: Mutex::new(StoreState::Idle),
            slot_released: Condvar::new(),
            corrupted: AtomicBool::new(false),
        })
    }

    /// Reads the arena image and rebuilds the free list from the gaps between
    /// the nodes of every table and the table directory.
    fn restore(
        backend: &mut B,
        block: &Superblock,
        config: &StoreConfig,
    ) -> Result<ArenaAllocator, StorageError> {
        if block.arena_len > config.max_arena_size {
            return Err(StorageError::Config(format!(
                "stored arena of {} bytes exceeds max_arena_size {}",
                block.arena_len, config.max_arena_size
            )));
        }
        if block.arena_len > backend.len() {
            return Err(StorageError::corrupted(format!(
                "superblock names {} arena bytes, file holds {}",
                block.arena_len,
                backend.len()
            )));
        }

        let image = backend.read(0, block.arena_len as usize)?;
        let mut live = Vec::new();
        for state in block.tables.values() {
            if let Some(root) = state.root {
                FreeListWriter::reachable(&image, root, &mut live)?;
            }
        }
        if let Some((offset, len)) = block.directory {
            live.push((offset, align(len)));
        }
        ArenaAllocator::restore(image, config.max_arena_size, live)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Opens a read transaction pinned at the current version.
    pub fn begin_read(&self) -> Result<ReadHandle<'_, B>, StorageError> {
        self.ensure_usable()?;
        let snapshot = self.tracker.lock()?.pin();
        debug!("read transaction pinned at version {}", snapshot.version);
        Ok(ReadHandle {
            store: self,
            snapshot,
        })
    }

    /// Opens the write transaction, treating a busy writer slot according to
    /// the configured [`WritePolicy`].
    pub fn begin_write(&self) -> Result<WriteHandle<'_, B>, StorageError> {
        self.acquire_writer(self.config.write_policy)
    }

    /// Like [`begin_write`](Self::begin_write) but waits at most `timeout`.
    pub fn begin_write_timeout(&self, timeout: Duration) -> Result<WriteHandle<'_, B>, StorageError> {
        self.acquire_writer(WritePolicy::Wait(timeout))
    }

    fn acquire_writer(&self, policy: WritePolicy) -> Result<WriteHandle<'_, B>, StorageError> {
        self.ensure_usable()?;

        let mut state = self.slot.lock()?;
        match policy {
            WritePolicy::Block => {
                state = self
                    .slot_released
                    .wait_while(state, |s| *s != StoreState::Idle)?;
            }
            WritePolicy::Fail => {
                if *state != StoreState::Idle {
                    return Err(StorageError::WriteConflict);
                }
            }
            WritePolicy::Wait(timeout) => {
                let (guard, waited) =
                    self.slot_released
                        .wait_timeout_while(state, timeout, |s| *s != StoreState::Idle)?;
                state = guard;
                if waited.timed_out() && *state != StoreState::Idle {
                    return Err(StorageError::WriteTimeout(timeout));
                }
            }
        }
        *state = StoreState::Writing;
        drop(state);

        // a writer that waited may find the store poisoned by the previous one
        if let Err(e) = self.ensure_usable() {
            self.release_writer();
            return Err(e);
        }

        let base = Arc::clone(&self.tracker.lock()?.current);
        debug!("write transaction opened on version {}", base.version);
        Ok(WriteHandle::new(self, base))
    }

    fn release_writer(&self) {
        let mut state = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *state = StoreState::Idle;
        self.slot_released.notify_all();
    }

    fn set_state(&self, next: StoreState) -> Result<(), StorageError> {
        *self.slot.lock()? = next;
        Ok(())
    }

    pub fn state(&self) -> Result<StoreState, StorageError> {
        Ok(*self.slot.lock()?)
    }

    pub fn current_version(&self) -> Result<Version, StorageError> {
        Ok(self.tracker.lock()?.current.version)
    }

    /// Oldest version a reader still holds, or the current version when no
    /// reader is open.
    pub fn oldest_reachable_version(&self) -> Result<Version, StorageError> {
        Ok(self.tracker.lock()?.oldest_reachable())
    }

    /// Runs a reclaim pass outside of a commit, typically after readers were
    /// released. Returns how many free entries became reusable.
    pub fn reclaim(&self) -> Result<usize, StorageError> {
        self.ensure_usable()?;
        let mut arena = self.arena.write()?;
        let (oldest, pinned) = {
            let tracker = self.tracker.lock()?;
            (tracker.oldest_reachable(), tracker.pinned())
        };
        let reclaimed = self.writer.reclaim(&mut arena, oldest, &pinned);
        debug!("reclaim below version {oldest} promoted {reclaimed} entries");
        Ok(reclaimed)
    }

    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        let (version, oldest_reachable, readers, tables, directory) = {
            let tracker = self.tracker.lock()?;
            (
                tracker.current.version,
                tracker.oldest_reachable(),
                tracker.pins.values().sum::<usize>(),
                tracker.current.tables.len(),
                tracker.current.directory,
            )
        };
        let arena = self.arena.read()?;
        Ok(StoreStats {
            version,
            oldest_reachable,
            readers,
            tables,
            arena_len: arena.len(),
            allocated_bytes: arena.allocated_bytes(),
            free_bytes: arena.free_bytes(),
            pending_frees: arena.pending().len(),
            directory_bytes: directory.map_or(0, |(_, len)| align(len)),
        })
    }

    /// Syncs the backend and hands it back.
    pub fn close(self) -> Result<B, StorageError> {
        let mut durable = self.durable.into_inner()?;
        durable.backend.sync()?;
        info!("closed store");
        Ok(durable.backend)
    }

    fn ensure_usable(&self) -> Result<(), StorageError> {
        if self.corrupted.load(Ordering::Acquire) {
            return Err(StorageError::Unusable);
        }
        Ok(())
    }

    /// Latches the store as unusable when `result` carries a fatal error.
    fn check<T>(&self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.corrupted.swap(true, Ordering::AcqRel) {
                error!("store marked unusable: {e}");
            }
        }
        result
    }

    fn read_tree(&self, table: TableKey, state: &TableState) -> ClusterTree<ArenaSource<'_>> {
        ClusterTree::new(
            ArenaSource::new(&self.arena),
            table,
            state.root.map(NodeRef::Stored),
            state.size,
            self.config.fanout(),
        )
    }

    /// Step 1 of a commit: places every dirty node and the new table
    /// directory, and copies out the bytes the backend needs. Regions placed
    /// so far are reported through `placed`, on error as well.
    fn place(
        &self,
        arena: &mut ArenaAllocator,
        handle: &mut WriteHandle<'_, B>,
        version: Version,
        placed: &mut Vec<(Offset, u64)>,
    ) -> Result<(Superblock, Vec<(Offset, Vec<u8>)>), StorageError> {
        let mut block = Superblock {
            version,
            next_table: handle.next_table,
            ..Superblock::default()
        };
        for (key, table) in handle.tables.iter() {
            let root = match table.root {
                Some(root) => Some(self.writer.write_dirty_nodes(
                    arena,
                    &mut handle.workspace,
                    root,
                    version,
                    placed,
                )?),
                None => None,
            };
            block.tables.insert(
                *key,
                TableState {
                    name: table.name.clone(),
                    root,
                    size: table.size,
                    next_key: table.next_key,
                },
            );
        }

        let directory = block.encode_directory()?;
        let offset = arena.allocate(directory.len() as u64)?;
        placed.push((offset, directory.len() as u64));
        arena.write(offset, &directory)?;
        block.directory = Some((offset, directory.len() as u64));
        block.arena_len = arena.len();

        let mut writes = Vec::with_capacity(placed.len());
        for (offset, len) in placed.iter() {
            writes.push((*offset, arena.read(*offset, *len)?.to_vec()));
        }
        Ok((block, writes))
    }

    /// Step 2 of a commit, run without the arena lock.
    fn persist(&self, writes: &[(Offset, Vec<u8>)], block: &Superblock) -> Result<(), StorageError> {
        let mut guard = self.durable.lock()?;
        let durable = &mut *guard;
        for (offset, bytes) in writes {
            durable.backend.flush(*offset, bytes)?;
        }
        durable.active = superblock::publish(&mut durable.backend, durable.active, block)?;
        Ok(())
    }

    /// Steps 3 to 5 of a commit.
    fn publish(
        &self,
        arena: &mut ArenaAllocator,
        block: Superblock,
    ) -> Result<Version, StorageError> {
        let version = block.version;
        let block = Arc::new(block);
        let previous = std::mem::replace(&mut self.tracker.lock()?.current, Arc::clone(&block));

        let mut released = 0;
        for (key, old) in previous.tables.iter() {
            let new_root = block.tables.get(key).and_then(|state| state.root);
            if old.root == new_root {
                continue;
            }
            released += self
                .writer
                .release_superseded(arena, old.root, new_root, version)
                .map_err(|e| {
                    StorageError::corrupted(format!("releasing nodes of table {key}: {e}"))
                })?
                .len();
        }
        if let Some((offset, len)) = previous.directory {
            arena.free(offset, len, version).map_err(|e| {
                StorageError::corrupted(format!(
                    "releasing table directory of version {}: {e}",
                    previous.version
                ))
            })?;
        }

        let (oldest, pinned) = {
            let tracker = self.tracker.lock()?;
            (tracker.oldest_reachable(), tracker.pinned())
        };
        let reclaimed = self.writer.reclaim(arena, oldest, &pinned);
        info!(
            "committed version {version}: released {released} nodes, reclaimed {reclaimed} regions"
        );
        Ok(version)
    }
}

/// A pinned, immutable view of one committed version.
#[derive(Debug)]
pub struct ReadHandle<'s, B: StorageBackend> {
    store: &'s VersionedStore<B>,
    snapshot: Arc<Superblock>,
}

impl<B: StorageBackend> ReadHandle<'_, B> {
    pub fn version(&self) -> Version {
        self.snapshot.version
    }

    pub fn tables(&self) -> Vec<(TableKey, String)> {
        self.snapshot
            .tables
            .iter()
            .map(|(key, state)| (*key, state.name.clone()))
            .collect()
    }

    pub fn table_key(&self, name: &str) -> Option<TableKey> {
        self.snapshot.table_by_name(name)
    }

    fn table(&self, table: TableKey) -> Result<&TableState, StorageError> {
        self.snapshot
            .tables
            .get(&table)
            .ok_or(StorageError::TableNotFound(table))
    }

    pub fn size(&self, table: TableKey) -> Result<u64, StorageError> {
        Ok(self.table(table)?.size)
    }

    pub fn root(&self, table: TableKey) -> Result<Option<Offset>, StorageError> {
        Ok(self.table(table)?.root)
    }

    pub fn next_key(&self, table: TableKey) -> Result<ObjectKey, StorageError> {
        Ok(ObjectKey::new(self.table(table)?.next_key))
    }

    pub fn get(&self, table: TableKey, key: ObjectKey) -> Result<Values, StorageError> {
        let state = self.table(table)?;
        self.store.check(self.store.read_tree(table, state).get(key))
    }

    pub fn iterate<F>(&self, table: TableKey, visitor: F) -> Result<ControlFlow<()>, StorageError>
    where
        F: FnMut(ObjectKey, &[u8]) -> ControlFlow<()>,
    {
        let state = self.table(table)?;
        self.store
            .check(self.store.read_tree(table, state).iterate(visitor))
    }

    pub fn height(&self, table: TableKey) -> Result<usize, StorageError> {
        let state = self.table(table)?;
        self.store.check(self.store.read_tree(table, state).height())
    }

    pub fn leaf_occupancy(&self, table: TableKey) -> Result<Vec<usize>, StorageError> {
        let state = self.table(table)?;
        self.store
            .check(self.store.read_tree(table, state).leaf_occupancy())
    }

    pub fn verify(&self, table: TableKey) -> Result<(), StorageError> {
        let state = self.table(table)?;
        self.store.check(self.store.read_tree(table, state).verify())
    }

    pub fn structure(&self, table: TableKey) -> Result<String, StorageError> {
        let state = self.table(table)?;
        self.store
            .check(self.store.read_tree(table, state).structure())
    }

    /// Unpins the version. Same as dropping the handle.
    pub fn release(self) {}
}

impl<B: StorageBackend> Drop for ReadHandle<'_, B> {
    fn drop(&mut self) {
        let mut tracker = self.store.tracker.lock().unwrap_or_else(|e| e.into_inner());
        tracker.unpin(self.snapshot.version);
        debug!("read transaction on version {} released", self.snapshot.version);
    }
}

#[derive(Debug)]
struct WorkingTable {
    name: String,
    root: Option<NodeRef>,
    size: u64,
    next_key: i64,
}

/// The single open write transaction.
///
/// Dropping the handle without [`commit`](Self::commit) rolls back.
#[derive(Debug)]
pub struct WriteHandle<'s, B: StorageBackend> {
    store: &'s VersionedStore<B>,
    base: Arc<Superblock>,
    workspace: Workspace<'s>,
    tables: BTreeMap<TableKey, WorkingTable>,
    next_table: TableKey,
    finished: bool,
}

impl<'s, B: StorageBackend> WriteHandle<'s, B> {
    fn new(store: &'s VersionedStore<B>, base: Arc<Superblock>) -> Self {
        let tables = base
            .tables
            .iter()
            .map(|(key, state)| {
                (
                    *key,
                    WorkingTable {
                        name: state.name.clone(),
                        root: state.root.map(NodeRef::Stored),
                        size: state.size,
                        next_key: state.next_key,
                    },
                )
            })
            .collect();

        Self {
            store,
            next_table: base.next_table,
            base,
            workspace: Workspace::new(&store.arena),
            tables,
            finished: false,
        }
    }

    /// Version this transaction started from.
    pub fn base_version(&self) -> Version {
        self.base.version
    }

    pub fn create_table(&mut self, name: &str) -> Result<TableKey, StorageError> {
        if self.table_key(name).is_some() {
            return Err(StorageError::TableExists(name.to_string()));
        }
        let key = self.next_table;
        self.next_table = key.next();
        self.tables.insert(
            key,
            WorkingTable {
                name: name.to_string(),
                root: None,
                size: 0,
                next_key: 0,
            },
        );
        debug!("created table '{name}' as {key}");
        Ok(key)
    }

    /// Drops a table. Its nodes are released when the transaction commits.
    pub fn drop_table(&mut self, table: TableKey) -> Result<(), StorageError> {
        self.tables
            .remove(&table)
            .map(|_| ())
            .ok_or(StorageError::TableNotFound(table))
    }

    pub fn table_key(&self, name: &str) -> Option<TableKey> {
        self.tables
            .iter()
            .find(|(_, table)| table.name == name)
            .map(|(key, _)| *key)
    }

    pub fn tables(&self) -> Vec<(TableKey, String)> {
        self.tables
            .iter()
            .map(|(key, table)| (*key, table.name.clone()))
            .collect()
    }

    /// Inserts an object under an explicit key and returns the working root.
    pub fn insert(
        &mut self,
        table: TableKey,
        key: ObjectKey,
        values: Values,
    ) -> Result<NodeRef, StorageError> {
        let root = self.with_tree(table, |tree| tree.insert(key, values))?;
        if key.is_valid() {
            if let Some(state) = self.tables.get_mut(&table) {
                state.next_key = state.next_key.max(key.value() + 1);
            }
        }
        Ok(root)
    }

    /// Inserts an object under the table's next unused key.
    pub fn create_object(
        &mut self,
        table: TableKey,
        values: Values,
    ) -> Result<ObjectKey, StorageError> {
        let key = ObjectKey::new(self.working(table)?.next_key);
        if !key.is_valid() {
            return Err(StorageError::InvalidKey(key));
        }
        self.insert(table, key, values)?;
        Ok(key)
    }

    pub fn erase(&mut self, table: TableKey, key: ObjectKey) -> Result<Values, StorageError> {
        self.with_tree(table, |tree| tree.erase(key))
    }

    pub fn get(&self, table: TableKey, key: ObjectKey) -> Result<Values, StorageError> {
        let tree = self.tree(table)?;
        self.store.check(tree.get(key))
    }

    pub fn iterate<F>(&self, table: TableKey, visitor: F) -> Result<ControlFlow<()>, StorageError>
    where
        F: FnMut(ObjectKey, &[u8]) -> ControlFlow<()>,
    {
        let tree = self.tree(table)?;
        self.store.check(tree.iterate(visitor))
    }

    pub fn size(&self, table: TableKey) -> Result<u64, StorageError> {
        Ok(self.working(table)?.size)
    }

    pub fn verify(&self, table: TableKey) -> Result<(), StorageError> {
        let tree = self.tree(table)?;
        self.store.check(tree.verify())
    }

    /// Publishes every change as a new version.
    pub fn commit(mut self) -> Result<Version, StorageError> {
        self.finished = true;
        let store = self.store;
        let result = self.try_commit();
        if let Err(e) = &result {
            warn!(
                "commit on version {} rolled back: {e}",
                self.base.version
            );
        }
        self.workspace.clear();
        store.release_writer();
        store.check(result)
    }

    fn try_commit(&mut self) -> Result<Version, StorageError> {
        let store = self.store;
        store.set_state(StoreState::Committing)?;
        let version = self.base.version + 1;

        // the arena lock is not held while the backend writes and syncs
        let mut placed = Vec::new();
        let placement = {
            let mut arena = store.arena.write()?;
            store.place(&mut arena, self, version, &mut placed)
        };
        let persisted = placement.and_then(|(block, writes)| {
            store.persist(&writes, &block)?;
            Ok(block)
        });

        let mut arena = store.arena.write()?;
        match persisted {
            Ok(block) => store.publish(&mut arena, block),
            Err(e) => {
                for (offset, len) in placed {
                    arena.release_unpublished(offset, len)?;
                }
                Err(e)
            }
        }
    }

    /// Discards every change.
    pub fn rollback(mut self) {
        self.finished = true;
        self.discard();
    }

    fn discard(&mut self) {
        debug!(
            "write transaction on version {} rolled back ({} dirty nodes)",
            self.base.version,
            self.workspace.dirty_count()
        );
        self.workspace.clear();
        self.store.release_writer();
    }

    fn working(&self, table: TableKey) -> Result<&WorkingTable, StorageError> {
        self.tables
            .get(&table)
            .ok_or(StorageError::TableNotFound(table))
    }

    fn tree(&self, table: TableKey) -> Result<ClusterTree<&Workspace<'s>>, StorageError> {
        let state = self.working(table)?;
        Ok(ClusterTree::new(
            &self.workspace,
            table,
            state.root,
            state.size,
            self.store.config.fanout(),
        ))
    }

    fn with_tree<T, F>(&mut self, table: TableKey, edit: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut ClusterTree<&mut Workspace<'s>>) -> Result<T, StorageError>,
    {
        let fanout = self.store.config.fanout();
        let state = self
            .tables
            .get_mut(&table)
            .ok_or(StorageError::TableNotFound(table))?;

        let mut tree = ClusterTree::new(&mut self.workspace, table, state.root, state.size, fanout);
        let result = edit(&mut tree);
        let (root, size) = tree.into_parts();
        state.root = root;
        state.size = size;

        self.store.check(result)
    }
}

impl<B: StorageBackend> Drop for WriteHandle<'_, B> {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread, time::Instant};

    use tempdir::TempDir;

    use crate::storage::{
        BackendError,
        header::file::{HEADER_SIZE, SLOT_SIZE},
    };

    use super::*;

    fn store(fanout: usize) -> VersionedStore {
        VersionedStore::in_memory(StoreConfig::default().with_fanout(fanout)).unwrap()
    }

    fn key(k: i64) -> ObjectKey {
        ObjectKey::new(k)
    }

    fn value(k: i64) -> Values {
        format!("value-{k}").into_bytes()
    }

    fn keys<B: StorageBackend>(reader: &ReadHandle<'_, B>, table: TableKey) -> Vec<i64> {
        let mut out = Vec::new();
        reader
            .iterate(table, |k, _| {
                out.push(k.value());
                ControlFlow::Continue(())
            })
            .unwrap();
        out
    }

    /// Creates table "objects" holding `keys` and commits it.
    fn populated<B: StorageBackend>(
        store: &VersionedStore<B>,
        keys: impl IntoIterator<Item = i64>,
    ) -> TableKey {
        let mut w = store.begin_write().unwrap();
        let table = w.create_table("objects").unwrap();
        for k in keys {
            w.insert(table, key(k), value(k)).unwrap();
        }
        w.commit().unwrap();
        table
    }

    #[test]
    fn commit_publishes_new_version() {
        let store = store(8);
        assert_eq!(store.current_version().unwrap(), 0);

        let table = populated(&store, 1..=3);
        assert_eq!(store.current_version().unwrap(), 1);
        assert_eq!(store.state().unwrap(), StoreState::Idle);

        let r = store.begin_read().unwrap();
        assert_eq!(r.version(), 1);
        assert_eq!(r.table_key("objects"), Some(table));
        assert_eq!(r.get(table, key(2)).unwrap(), value(2));
        assert_eq!(keys(&r, table), vec![1, 2, 3]);
    }

    #[test]
    fn sequential_keys_build_expected_height() {
        let store = store(8);
        let table = populated(&store, 1..=1000);

        let r = store.begin_read().unwrap();
        assert_eq!(r.height(table).unwrap(), 4);
        let leaves = r.leaf_occupancy(table).unwrap();
        assert!(leaves.iter().all(|n| (4..=8).contains(n)));
        r.verify(table).unwrap();
    }

    #[test]
    fn reader_keeps_erased_object() {
        let store = store(8);
        let table = populated(&store, [5]);

        let old = store.begin_read().unwrap();
        assert_eq!(old.version(), 1);

        let mut w = store.begin_write().unwrap();
        assert_eq!(w.erase(table, key(5)).unwrap(), value(5));
        assert_eq!(w.commit().unwrap(), 2);

        assert_eq!(old.get(table, key(5)).unwrap(), value(5));
        let new = store.begin_read().unwrap();
        assert_eq!(new.version(), 2);
        assert!(matches!(
            new.get(table, key(5)),
            Err(StorageError::KeyNotFound(k)) if k == key(5)
        ));
    }

    #[test]
    fn out_of_space_rolls_back_the_commit() {
        let config = StoreConfig::default()
            .with_fanout(4)
            .with_max_arena_size(HEADER_SIZE as u64 + 512);
        let store = VersionedStore::in_memory(config).unwrap();
        let table = populated(&store, []);

        let mut failed = false;
        for k in 0..1000 {
            let (size, root, version) = {
                let r = store.begin_read().unwrap();
                (r.size(table).unwrap(), r.root(table).unwrap(), r.version())
            };
            let before = store.stats().unwrap();

            let mut w = store.begin_write().unwrap();
            w.insert(table, key(k), vec![0xAB; 32]).unwrap();
            match w.commit() {
                Ok(_) => continue,
                Err(StorageError::OutOfSpace { .. }) => {}
                Err(e) => panic!("unexpected error {e}"),
            }

            let r = store.begin_read().unwrap();
            assert_eq!(r.size(table).unwrap(), size);
            assert_eq!(r.root(table).unwrap(), root);
            assert_eq!(r.version(), version);
            r.verify(table).unwrap();
            assert!(matches!(
                r.get(table, key(k)),
                Err(StorageError::KeyNotFound(_))
            ));
            let after = store.stats().unwrap();
            assert_eq!(after.arena_len, before.arena_len);
            assert_eq!(after.allocated_bytes, before.allocated_bytes);

            failed = true;
            break;
        }
        assert!(failed, "arena never ran out of space");

        // the writer slot was released
        assert_eq!(store.state().unwrap(), StoreState::Idle);
        assert!(store.begin_write().is_ok());
    }

    #[test]
    fn erase_everything_reclaims_all_space() {
        let store = store(4);
        let table = populated(&store, 0..200);

        let mut order: Vec<i64> = (0..200).collect();
        // interleave ends and middle
        order.sort_by_key(|k| (k % 7, -k));
        for chunk in order.chunks(25) {
            let mut w = store.begin_write().unwrap();
            for k in chunk {
                w.erase(table, key(*k)).unwrap();
            }
            w.verify(table).unwrap();
            w.commit().unwrap();
        }

        let r = store.begin_read().unwrap();
        assert_eq!(r.size(table).unwrap(), 0);
        assert_eq!(r.root(table).unwrap(), None);
        drop(r);

        // nothing but the directory of the empty table is left
        let stats = store.stats().unwrap();
        assert_eq!(stats.allocated_bytes, stats.directory_bytes);
        assert_eq!(stats.pending_frees, 0);
    }

    #[test]
    fn pinned_reader_delays_reclaim() {
        let store = store(4);
        let table = populated(&store, 0..50);

        let reader = store.begin_read().unwrap();
        let mut w = store.begin_write().unwrap();
        for k in 0..50 {
            w.erase(table, key(k)).unwrap();
        }
        w.commit().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.oldest_reachable, 1);
        assert!(stats.pending_frees > 0);
        assert_eq!(keys(&reader, table), (0..50).collect::<Vec<_>>());

        drop(reader);
        assert!(store.reclaim().unwrap() > 0);
        let stats = store.stats().unwrap();
        assert_eq!(stats.pending_frees, 0);
        assert_eq!(stats.allocated_bytes, stats.directory_bytes);
    }

    #[test]
    fn reclaim_twice_changes_nothing() {
        let store = store(4);
        let table = populated(&store, 0..30);
        let reader = store.begin_read().unwrap();

        let mut w = store.begin_write().unwrap();
        w.erase(table, key(3)).unwrap();
        w.commit().unwrap();
        drop(reader);

        store.reclaim().unwrap();
        let first = store.stats().unwrap();
        assert_eq!(store.reclaim().unwrap(), 0);
        assert_eq!(store.stats().unwrap(), first);
    }

    #[test]
    fn rollback_discards_changes() {
        let store = store(8);
        let table = populated(&store, 0..10);

        let mut w = store.begin_write().unwrap();
        w.erase(table, key(1)).unwrap();
        w.insert(table, key(100), value(100)).unwrap();
        w.create_table("scratch").unwrap();
        assert_eq!(w.size(table).unwrap(), 10);
        w.rollback();

        {
            // dropping an open handle is a rollback too
            let mut w = store.begin_write().unwrap();
            w.erase(table, key(2)).unwrap();
        }

        assert_eq!(store.current_version().unwrap(), 1);
        let r = store.begin_read().unwrap();
        assert_eq!(keys(&r, table), (0..10).collect::<Vec<_>>());
        assert_eq!(r.table_key("scratch"), None);
    }

    #[test]
    fn write_handle_sees_its_own_changes() {
        let store = store(8);
        let table = populated(&store, [1]);

        let mut w = store.begin_write().unwrap();
        w.insert(table, key(2), value(2)).unwrap();
        assert_eq!(w.get(table, key(2)).unwrap(), value(2));

        let r = store.begin_read().unwrap();
        assert!(r.get(table, key(2)).is_err());
        w.commit().unwrap();
        assert!(r.get(table, key(2)).is_err());
    }

    #[test]
    fn create_object_never_reuses_keys() {
        let store = store(8);
        let mut w = store.begin_write().unwrap();
        let table = w.create_table("people").unwrap();
        let a = w.create_object(table, value(0)).unwrap();
        let b = w.create_object(table, value(1)).unwrap();
        assert_eq!((a, b), (key(0), key(1)));
        w.insert(table, key(10), value(10)).unwrap();
        w.commit().unwrap();

        let mut w = store.begin_write().unwrap();
        w.erase(table, key(10)).unwrap();
        w.erase(table, b).unwrap();
        assert_eq!(w.create_object(table, vec![]).unwrap(), key(11));
        w.commit().unwrap();
    }

    #[test]
    fn table_errors() {
        let store = store(8);
        let mut w = store.begin_write().unwrap();
        let table = w.create_table("people").unwrap();

        assert!(matches!(
            w.create_table("people"),
            Err(StorageError::TableExists(name)) if name == "people"
        ));
        assert!(matches!(
            w.insert(TableKey::new(9), key(1), vec![]),
            Err(StorageError::TableNotFound(_))
        ));
        assert!(matches!(
            w.insert(table, ObjectKey::NULL, vec![]),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            w.insert(table, key(i64::MAX), vec![]),
            Err(StorageError::InvalidKey(_))
        ));
        assert_eq!(w.size(table).unwrap(), 0);
        w.insert(table, key(1), vec![]).unwrap();
        assert!(matches!(
            w.insert(table, key(1), vec![]),
            Err(StorageError::DuplicateKey(_))
        ));
        // recoverable errors do not end the transaction
        w.commit().unwrap();
        assert!(store.begin_read().is_ok());
    }

    #[test]
    fn drop_table_releases_its_nodes() {
        let store = store(4);
        let table = populated(&store, 0..100);
        let mut w = store.begin_write().unwrap();
        let other = w.create_table("other").unwrap();
        w.insert(other, key(1), value(1)).unwrap();
        w.commit().unwrap();

        let mut w = store.begin_write().unwrap();
        w.drop_table(table).unwrap();
        assert!(matches!(
            w.drop_table(table),
            Err(StorageError::TableNotFound(_))
        ));
        w.commit().unwrap();

        let r = store.begin_read().unwrap();
        assert_eq!(r.tables(), vec![(other, "other".to_string())]);
        assert!(matches!(r.size(table), Err(StorageError::TableNotFound(_))));
        drop(r);

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending_frees, 0);
        // only the single leaf of "other" and the directory are left
        assert!(stats.allocated_bytes - stats.directory_bytes < 64);
    }

    #[test]
    fn second_writer_fails_fast() {
        let config = StoreConfig::default().with_write_policy(WritePolicy::Fail);
        let store = VersionedStore::in_memory(config).unwrap();

        let w = store.begin_write().unwrap();
        assert_eq!(store.state().unwrap(), StoreState::Writing);
        assert!(matches!(
            store.begin_write(),
            Err(StorageError::WriteConflict)
        ));
        w.rollback();
        assert!(store.begin_write().is_ok());
    }

    #[test]
    fn second_writer_times_out() {
        let store = store(8);
        let _w = store.begin_write().unwrap();

        let started = Instant::now();
        let timeout = Duration::from_millis(20);
        assert!(matches!(
            store.begin_write_timeout(timeout),
            Err(StorageError::WriteTimeout(d)) if d == timeout
        ));
        assert!(started.elapsed() >= timeout);
    }

    #[test]
    fn blocked_writer_proceeds_after_commit() {
        let store = store(8);
        let table = populated(&store, []);
        let barrier = Barrier::new(2);

        thread::scope(|s| {
            let mut w = store.begin_write().unwrap();
            s.spawn(|| {
                barrier.wait();
                let mut w = store.begin_write().unwrap();
                // the first writer's object is visible
                assert_eq!(w.get(table, key(1)).unwrap(), value(1));
                w.insert(table, key(2), value(2)).unwrap();
                w.commit().unwrap();
            });

            barrier.wait();
            thread::sleep(Duration::from_millis(10));
            w.insert(table, key(1), value(1)).unwrap();
            w.commit().unwrap();
        });

        let r = store.begin_read().unwrap();
        assert_eq!(r.version(), 3);
        assert_eq!(keys(&r, table), vec![1, 2]);
    }

    #[test]
    fn readers_see_their_snapshot_during_commits() {
        let store = store(4);
        let table = populated(&store, (0..100).map(|k| k * 2));

        let reader = store.begin_read().unwrap();
        let expected: Vec<(i64, Values)> = (0..100).map(|k| (k * 2, value(k * 2))).collect();

        thread::scope(|s| {
            s.spawn(|| {
                for round in 0..10 {
                    let mut w = store.begin_write().unwrap();
                    for n in 0..10 {
                        let k = round * 10 + n;
                        w.erase(table, key(k * 2)).unwrap();
                        w.insert(table, key(k * 2 + 1), value(-k)).unwrap();
                    }
                    w.commit().unwrap();
                }
            });

            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..20 {
                        let mut seen = Vec::new();
                        reader
                            .iterate(table, |k, v| {
                                seen.push((k.value(), v.to_vec()));
                                ControlFlow::Continue(())
                            })
                            .unwrap();
                        assert_eq!(seen, expected);
                        assert_eq!(reader.get(table, key(10)).unwrap(), value(10));
                    }
                });
            }
        });

        assert_eq!(reader.version(), 1);
        drop(reader);
        let r = store.begin_read().unwrap();
        assert_eq!(r.version(), 11);
        r.verify(table).unwrap();
        assert!(matches!(r.get(table, key(10)), Err(StorageError::KeyNotFound(_))));
    }

    #[test]
    fn reopen_from_file() {
        let temp = TempDir::new("reopen").unwrap();
        let path = temp.path().join("cluster.db");
        let config = StoreConfig::default().with_fanout(4);

        let store = VersionedStore::open(&path, config.clone()).unwrap();
        let table = populated(&store, 0..60);
        let mut w = store.begin_write().unwrap();
        for k in 10..20 {
            w.erase(table, key(k)).unwrap();
        }
        w.commit().unwrap();
        let stats = store.stats().unwrap();
        store.close().unwrap();

        let store = VersionedStore::open(&path, config).unwrap();
        assert_eq!(store.current_version().unwrap(), 2);
        let reopened = store.stats().unwrap();
        assert_eq!(reopened.allocated_bytes, stats.allocated_bytes);
        assert_eq!(reopened.pending_frees, 0);

        let r = store.begin_read().unwrap();
        r.verify(table).unwrap();
        assert_eq!(r.size(table).unwrap(), 50);
        assert_eq!(r.next_key(table).unwrap(), key(60));
        assert_eq!(r.get(table, key(42)).unwrap(), value(42));
        drop(r);

        // the rebuilt free list is usable
        let mut w = store.begin_write().unwrap();
        w.insert(table, key(15), value(15)).unwrap();
        w.commit().unwrap();
        let r = store.begin_read().unwrap();
        r.verify(table).unwrap();
        assert_eq!(r.size(table).unwrap(), 51);
    }

    #[test]
    fn reopen_rejects_damaged_node() {
        let store = store(8);
        let table = populated(&store, 0..5);
        let root = store.begin_read().unwrap().root(table).unwrap().unwrap();
        let mut backend = store.close().unwrap();

        // the node kind byte
        backend.flush(root, &[0x7]).unwrap();
        assert!(matches!(
            VersionedStore::with_backend(backend, StoreConfig::default().with_fanout(8)),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn corruption_makes_store_unusable() {
        let store = store(8);
        let table = populated(&store, 0..5);

        let r = store.begin_read().unwrap();
        let root = r.root(table).unwrap().unwrap();
        store.arena.write().unwrap().write(root, &[0x7]).unwrap();

        assert!(matches!(r.get(table, key(1)), Err(StorageError::Corrupted(_))));
        drop(r);
        assert!(matches!(store.begin_read(), Err(StorageError::Unusable)));
        assert!(matches!(store.begin_write(), Err(StorageError::Unusable)));
        assert!(matches!(store.reclaim(), Err(StorageError::Unusable)));
    }

    #[test]
    fn hundreds_of_tables_survive_reopen() {
        let temp = TempDir::new("tables").unwrap();
        let path = temp.path().join("cluster.db");
        let config = StoreConfig::default().with_fanout(4);
        let name = |n: i64| format!("table_with_a_rather_long_name_{n:04}");

        let store = VersionedStore::open(&path, config.clone()).unwrap();
        let mut w = store.begin_write().unwrap();
        let mut created = Vec::new();
        for n in 0..300 {
            let table = w.create_table(&name(n)).unwrap();
            w.insert(table, key(n), value(n)).unwrap();
            created.push(table);
        }
        w.commit().unwrap();
        // a second commit replaces the first directory
        let mut w = store.begin_write().unwrap();
        w.drop_table(created[0]).unwrap();
        w.commit().unwrap();
        store.close().unwrap();

        let store = VersionedStore::open(&path, config).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.tables, 299);
        assert!(stats.directory_bytes > SLOT_SIZE as u64);
        assert_eq!(stats.pending_frees, 0);

        let r = store.begin_read().unwrap();
        assert_eq!(r.table_key(&name(0)), None);
        for (n, table) in (0..).zip(created.iter()).skip(1) {
            assert_eq!(r.table_key(&name(n)), Some(*table));
            assert_eq!(r.get(*table, key(n)).unwrap(), value(n));
        }
    }

    #[test]
    fn old_reader_does_not_hold_back_later_churn() {
        let store = store(4);
        let table = populated(&store, [0]);
        let reader = store.begin_read().unwrap();

        for k in 1..=30 {
            let mut w = store.begin_write().unwrap();
            w.insert(table, key(k), value(k)).unwrap();
            w.commit().unwrap();
            // only the leaf and directory of version 1 wait for the reader
            assert!(store.stats().unwrap().pending_frees <= 2);
        }
        assert_eq!(keys(&reader, table), vec![0]);
        assert_eq!(reader.get(table, key(0)).unwrap(), value(0));

        drop(reader);
        assert_eq!(store.reclaim().unwrap(), 2);
        assert_eq!(store.stats().unwrap().pending_frees, 0);
    }

    /// Parks the first `sync` after being armed until the test lets it go.
    #[derive(Debug)]
    struct GatedBackend {
        inner: MemoryBackend,
        armed: Arc<AtomicBool>,
        gate: Arc<Barrier>,
    }

    impl StorageBackend for GatedBackend {
        fn read(&mut self, offset: u64, size: usize) -> Result<Vec<u8>, BackendError> {
            self.inner.read(offset, size)
        }

        fn flush(&mut self, offset: u64, bytes: &[u8]) -> Result<(), BackendError> {
            self.inner.flush(offset, bytes)
        }

        fn sync(&mut self) -> Result<(), BackendError> {
            if self.armed.swap(false, Ordering::AcqRel) {
                self.gate.wait();
                self.gate.wait();
            }
            self.inner.sync()
        }

        fn len(&self) -> u64 {
            self.inner.len()
        }
    }

    #[test]
    fn readers_run_while_commit_syncs() {
        let armed = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(Barrier::new(2));
        let backend = GatedBackend {
            inner: MemoryBackend::new(),
            armed: Arc::clone(&armed),
            gate: Arc::clone(&gate),
        };
        let store =
            VersionedStore::with_backend(backend, StoreConfig::default().with_fanout(4)).unwrap();
        let table = populated(&store, 0..20);

        armed.store(true, Ordering::Release);
        thread::scope(|s| {
            let committer = s.spawn(|| {
                let mut w = store.begin_write().unwrap();
                w.insert(table, key(100), value(100)).unwrap();
                w.commit().unwrap()
            });

            // the commit is parked inside its first sync
            gate.wait();
            assert_eq!(store.state().unwrap(), StoreState::Committing);
            assert!(store.arena.try_read().is_ok());
            assert!(store.arena.try_write().is_ok());
            let r = store.begin_read().unwrap();
            assert_eq!(r.version(), 1);
            assert_eq!(r.get(table, key(7)).unwrap(), value(7));
            assert!(matches!(
                r.get(table, key(100)),
                Err(StorageError::KeyNotFound(_))
            ));
            drop(r);
            gate.wait();

            assert_eq!(committer.join().unwrap(), 2);
        });

        let r = store.begin_read().unwrap();
        assert_eq!(r.get(table, key(100)).unwrap(), value(100));
        r.verify(table).unwrap();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = StoreConfig::default().with_fanout(3);
        assert!(matches!(
            VersionedStore::in_memory(config),
            Err(StorageError::Config(_))
        ));
    }
}
