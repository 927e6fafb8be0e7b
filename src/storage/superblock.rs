//! File header and the committed-state record.
//!
//! The first [`HEADER_SIZE`] bytes of the backend hold:
//!
//! ```text
//! 0        8       9          16             2056           4096
//! | magic  | slot  | reserved | superblock 0 | superblock 1 |
//! ```
//!
//! Each superblock slot is a big-endian `u32` length followed by a small
//! bincode-encoded record: version, arena length, next table key and where the
//! table directory lives. Only the slot named by the active byte is valid; a
//! commit writes the other one and flips the byte once the slot is durable.
//!
//! The table directory itself is an arena region framed with a node header of
//! kind `NODE_DIRECTORY`. Every commit places a fresh copy and releases the
//! previous one like any superseded node, so the number of tables is bounded
//! by the arena only.
use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use log::{debug, info};

use super::{
    Offset, StorageError, Version,
    backend::StorageBackend,
    codec_config,
    error::BackendError,
    header::{
        file::{ACTIVE_SLOT, HEADER_SIZE, MAGIC, MAGIC_SIZE, SLOT_0, SLOT_1, SLOT_LEN_SIZE, SLOT_SIZE},
        node::{NODE_DIRECTORY, NODE_HEADER_SIZE},
    },
    keys::TableKey,
    node::{NodeHeader, frame},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct TableState {
    pub name: String,
    pub root: Option<Offset>,
    pub size: u64,
    /// Next key handed out by `create_object`; never decreases.
    pub next_key: i64,
}

impl TableState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// What a header slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
struct SlotRecord {
    version: Version,
    arena_len: u64,
    next_table: TableKey,
    directory: Option<(Offset, u64)>,
}

/// Everything needed to find the committed version inside the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version: Version,
    pub arena_len: u64,
    pub next_table: TableKey,
    /// Region holding the encoded `tables`, `None` before the first commit.
    pub directory: Option<(Offset, u64)>,
    pub tables: BTreeMap<TableKey, TableState>,
}

impl Default for Superblock {
    fn default() -> Self {
        Self {
            version: 0,
            arena_len: HEADER_SIZE as u64,
            next_table: TableKey::new(0),
            directory: None,
            tables: BTreeMap::new(),
        }
    }
}

impl Superblock {
    pub fn table_by_name(&self, name: &str) -> Option<TableKey> {
        self.tables
            .iter()
            .find(|(_, state)| state.name == name)
            .map(|(key, _)| *key)
    }

    /// Encodes the table directory as a framed region tagged with `version`.
    pub fn encode_directory(&self) -> Result<Vec<u8>, StorageError> {
        let entries: Vec<(&TableKey, &TableState)> = self.tables.iter().collect();
        let payload = bincode::encode_to_vec(&entries, codec_config())?;
        Ok(frame(
            NODE_DIRECTORY,
            entries.len(),
            self.version,
            TableKey::new(0),
            &payload,
        ))
    }

    /// Decodes a directory region written by [`encode_directory`](Self::encode_directory)
    /// for `version`.
    pub fn decode_directory(
        bytes: &[u8],
        version: Version,
    ) -> Result<BTreeMap<TableKey, TableState>, StorageError> {
        let header = NodeHeader::read(bytes)?;
        if header.kind != NODE_DIRECTORY {
            return Err(StorageError::corrupted(format!(
                "expected a table directory, found node kind {:#x}",
                header.kind
            )));
        }
        if header.version != version {
            return Err(StorageError::corrupted(format!(
                "table directory of version {} referenced by version {version}",
                header.version
            )));
        }

        let (entries, _): (Vec<(TableKey, TableState)>, usize) = bincode::decode_from_slice(
            &bytes[NODE_HEADER_SIZE..header.encoded_len()],
            codec_config(),
        )
        .map_err(|e| StorageError::corrupted(format!("table directory: {e}")))?;
        if entries.len() != header.entries {
            return Err(StorageError::corrupted(format!(
                "table directory announces {} tables, holds {}",
                header.entries,
                entries.len()
            )));
        }
        Ok(entries.into_iter().collect())
    }

    fn record(&self) -> SlotRecord {
        SlotRecord {
            version: self.version,
            arena_len: self.arena_len,
            next_table: self.next_table,
            directory: self.directory,
        }
    }

    fn to_slot(&self) -> Result<Vec<u8>, StorageError> {
        let payload = bincode::encode_to_vec(self.record(), codec_config())?;
        let needed = SLOT_LEN_SIZE + payload.len();
        if needed > SLOT_SIZE {
            return Err(BackendError::HeaderOverflow {
                needed,
                available: SLOT_SIZE,
            }
            .into());
        }

        let mut buf = Vec::with_capacity(needed);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decodes a slot. The directory is not loaded yet.
    fn from_slot(slot: &[u8]) -> Result<Self, StorageError> {
        let mut len = [0; SLOT_LEN_SIZE];
        len.copy_from_slice(&slot[..SLOT_LEN_SIZE]);
        let len = u32::from_be_bytes(len) as usize;
        if SLOT_LEN_SIZE + len > slot.len() {
            return Err(StorageError::corrupted(format!(
                "superblock of {len} bytes does not fit its slot"
            )));
        }

        let (record, _): (SlotRecord, usize) =
            bincode::decode_from_slice(&slot[SLOT_LEN_SIZE..SLOT_LEN_SIZE + len], codec_config())
                .map_err(|e| StorageError::corrupted(format!("superblock: {e}")))?;
        Ok(Self {
            version: record.version,
            arena_len: record.arena_len,
            next_table: record.next_table,
            directory: record.directory,
            tables: BTreeMap::new(),
        })
    }
}

fn slot_offset(slot: u8) -> u64 {
    match slot {
        0 => SLOT_0 as u64,
        _ => SLOT_1 as u64,
    }
}

/// Reads the active superblock and its table directory, or `None` for a
/// backend that was never formatted.
pub fn load<B: StorageBackend>(backend: &mut B) -> Result<Option<(u8, Superblock)>, StorageError> {
    if backend.is_empty() {
        return Ok(None);
    }
    if backend.len() < HEADER_SIZE as u64 {
        return Err(StorageError::corrupted(format!(
            "file of {} bytes is shorter than its header",
            backend.len()
        )));
    }

    let header = backend.read(0, HEADER_SIZE)?;
    if &header[..MAGIC_SIZE] != MAGIC {
        return Err(StorageError::corrupted("bad magic, not a clusterdb file"));
    }
    let active = header[ACTIVE_SLOT];
    if active > 1 {
        return Err(StorageError::corrupted(format!("active slot byte is {active}")));
    }

    let start = slot_offset(active) as usize;
    let mut block = Superblock::from_slot(&header[start..start + SLOT_SIZE])?;
    if let Some((offset, len)) = block.directory {
        let end = offset.checked_add(len).unwrap_or(u64::MAX);
        if offset < HEADER_SIZE as u64 || end > block.arena_len || end > backend.len() {
            return Err(StorageError::corrupted(format!(
                "table directory {offset}+{len} lies outside the arena of {} bytes",
                block.arena_len
            )));
        }
        let bytes = backend.read(offset, len as usize)?;
        block.tables = Superblock::decode_directory(&bytes, block.version)?;
    }
    debug!(
        "loaded superblock from slot {active}: version {}, {} tables",
        block.version,
        block.tables.len()
    );
    Ok(Some((active, block)))
}

/// Writes the header of a fresh backend with `block` in slot 0.
pub fn format<B: StorageBackend>(backend: &mut B, block: &Superblock) -> Result<u8, StorageError> {
    let mut header = vec![0; HEADER_SIZE];
    header[..MAGIC_SIZE].copy_from_slice(MAGIC);
    header[ACTIVE_SLOT] = 0;
    let slot = block.to_slot()?;
    header[SLOT_0..SLOT_0 + slot.len()].copy_from_slice(&slot);

    backend.flush(0, &header)?;
    backend.sync()?;
    info!("formatted new store");
    Ok(0)
}

/// Makes `block` the committed state: writes it into the inactive slot,
/// syncs, flips the active byte and syncs again. Returns the new active slot.
///
/// The directory region of `block` must already be flushed.
pub fn publish<B: StorageBackend>(
    backend: &mut B,
    active: u8,
    block: &Superblock,
) -> Result<u8, StorageError> {
    let next = 1 - active;
    let slot = block.to_slot()?;

    backend.flush(slot_offset(next), &slot)?;
    backend.sync()?;
    backend.flush(ACTIVE_SLOT as u64, &[next])?;
    backend.sync()?;
    Ok(next)
}
