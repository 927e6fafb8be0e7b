//! Versioned object storage.
//!
//! Everything below this module deals with one byte arena (the "file") and the
//! cluster trees stored inside it:
//!
//! - [`arena`]: region allocator with version-tagged pending frees.
//! - [`node`]: leaf/inner cluster nodes and their byte layout.
//! - [`tree`]: the per-table primary index over [`node`]s.
//! - [`writer`]: places dirty nodes into the arena and recycles superseded ones.
//! - [`store`]: read/write transactions over versions of the whole arena.
//! - [`backend`]: where committed bytes end up (memory or a file).
pub mod arena;
pub mod backend;
pub mod engine;
pub mod keys;
pub mod node;
pub mod source;
pub mod store;
pub mod superblock;
pub mod tree;
pub mod writer;

pub use arena::{ArenaAllocator, FreeSpaceEntry};
pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use engine::StorageEngine;
pub use error::{BackendError, StorageError};
pub use keys::{ObjectKey, TableKey};
pub use node::{ClusterNode, NodeRef};
pub use store::{ReadHandle, StoreState, StoreStats, VersionedStore, WriteHandle};
pub use tree::ClusterTree;
pub use writer::FreeListWriter;

/// Byte position inside the arena.
pub type Offset = u64;

/// Commit counter. Version `0` is the empty store.
pub type Version = u64;

pub mod header {
    pub mod node {
        pub(crate) const NODE_KIND_SIZE: usize = size_of::<u8>();
        pub(crate) const NODE_ENTRIES_SIZE: usize = size_of::<u32>();
        pub(crate) const NODE_VERSION_SIZE: usize = size_of::<u64>();
        pub(crate) const NODE_TABLE_SIZE: usize = size_of::<u32>();
        pub(crate) const NODE_PAYLOAD_SIZE: usize = size_of::<u32>();

        pub(crate) const NODE_KIND: usize = 0;
        // bytes 1..4 are padding so the counters stay aligned
        pub(crate) const NODE_ENTRIES: usize = 4;
        pub(crate) const NODE_VERSION: usize = NODE_ENTRIES + NODE_ENTRIES_SIZE;
        pub(crate) const NODE_TABLE: usize = NODE_VERSION + NODE_VERSION_SIZE;
        pub(crate) const NODE_PAYLOAD: usize = NODE_TABLE + NODE_TABLE_SIZE;
        pub(crate) const NODE_HEADER_SIZE: usize = NODE_PAYLOAD + NODE_PAYLOAD_SIZE;

        pub(crate) const NODE_LEAF: u8 = 0x0;
        pub(crate) const NODE_INNER: u8 = 0x1;
        /// Table directory of one version; framed like a node, never part of a tree.
        pub(crate) const NODE_DIRECTORY: u8 = 0x2;

        const _: () = assert!(NODE_KIND + NODE_KIND_SIZE <= NODE_ENTRIES);
    }

    pub mod file {
        pub(crate) const MAGIC: &[u8; 8] = b"CLSTRDB1";
        pub(crate) const MAGIC_SIZE: usize = 8;
        pub(crate) const ACTIVE_SLOT: usize = MAGIC_SIZE;

        pub(crate) const SLOT_LEN_SIZE: usize = size_of::<u32>();
        pub(crate) const SLOT_SIZE: usize = 2040;
        pub(crate) const SLOT_0: usize = 16;
        pub(crate) const SLOT_1: usize = SLOT_0 + SLOT_SIZE;

        /// Bytes reserved at the start of the arena; no node is ever placed here.
        pub const HEADER_SIZE: usize = SLOT_1 + SLOT_SIZE;

        /// Arena alignment for every allocated region.
        pub const ALIGNMENT: u64 = 8;
    }
}

pub mod error {
    use std::{io, time::Duration};

    use thiserror::Error;

    use super::{Offset, keys::ObjectKey, keys::TableKey};

    #[derive(Debug, Error)]
    pub enum BackendError {
        #[error("io: {0}")]
        Io(#[from] io::Error),

        #[error("failed to encode: {0}")]
        Serialize(#[from] bincode::error::EncodeError),

        #[error("failed to decode: {0}")]
        Deserialize(#[from] bincode::error::DecodeError),

        #[error("superblock needs {needed} bytes, slot holds {available}")]
        HeaderOverflow { needed: usize, available: usize },
    }

    #[derive(Debug, Error)]
    pub enum StorageError {
        #[error("duplicate key {0}")]
        DuplicateKey(ObjectKey),

        #[error("key {0} not found")]
        KeyNotFound(ObjectKey),

        #[error("invalid object key {0}")]
        InvalidKey(ObjectKey),

        #[error("[arena] out of space: {requested} more bytes would exceed the {limit} byte limit")]
        OutOfSpace { requested: u64, limit: u64 },

        #[error("[arena] no allocated region at offset {offset} of size {size}")]
        InvalidOffset { offset: Offset, size: u64 },

        #[error("another write transaction is open")]
        WriteConflict,

        #[error("gave up waiting for the write slot after {0:?}")]
        WriteTimeout(Duration),

        #[error("table {0} not found")]
        TableNotFound(TableKey),

        #[error("no table named '{0}'")]
        UnknownTable(String),

        #[error("table '{0}' already exists")]
        TableExists(String),

        #[error("[corruption] {0}")]
        Corrupted(String),

        #[error("store refuses operations after detecting corruption")]
        Unusable,

        #[error("invalid configuration: {0}")]
        Config(String),

        #[error("internal lock poisoned")]
        LockPoisoned,

        #[error("[backend] {cause}")]
        Backend {
            #[from]
            cause: BackendError,
        },
    }

    impl StorageError {
        /// Errors after which the arena can no longer be trusted.
        pub fn is_fatal(&self) -> bool {
            matches!(self, StorageError::Corrupted(_))
        }

        pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
            StorageError::Corrupted(reason.into())
        }
    }

    impl From<io::Error> for StorageError {
        fn from(value: io::Error) -> Self {
            StorageError::Backend {
                cause: BackendError::Io(value),
            }
        }
    }

    impl From<bincode::error::EncodeError> for StorageError {
        fn from(value: bincode::error::EncodeError) -> Self {
            StorageError::Backend {
                cause: BackendError::Serialize(value),
            }
        }
    }

    impl From<bincode::error::DecodeError> for StorageError {
        fn from(value: bincode::error::DecodeError) -> Self {
            StorageError::Backend {
                cause: BackendError::Deserialize(value),
            }
        }
    }

    impl<T> From<std::sync::PoisonError<T>> for StorageError {
        fn from(_: std::sync::PoisonError<T>) -> Self {
            StorageError::LockPoisoned
        }
    }
}

/// Shared bincode configuration for everything persisted by the store.
pub(crate) fn codec_config()
-> bincode::config::Configuration<bincode::config::BigEndian, bincode::config::Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Rounds `size` up to the arena alignment.
pub(crate) fn align(size: u64) -> u64 {
    let mask = header::file::ALIGNMENT - 1;
    (size + mask) & !mask
}
