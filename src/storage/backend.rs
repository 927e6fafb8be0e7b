//! Durable byte storage below the arena.
//!
//! A [`StorageBackend`] sees the store as one flat byte range: the file header
//! followed by the arena. The store only ever writes regions it just placed
//! and the header, then calls [`StorageBackend::sync`] before and after
//! flipping the active superblock slot.
use std::{
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};

use log::trace;

use super::error::BackendError;

pub trait StorageBackend: Send {
    /// Reads exactly `size` bytes at `offset`.
    fn read(&mut self, offset: u64, size: usize) -> Result<Vec<u8>, BackendError>;

    /// Writes `bytes` at `offset`, growing the backend if needed.
    fn flush(&mut self, offset: u64, bytes: &[u8]) -> Result<(), BackendError>;

    /// Makes every previous flush durable.
    fn sync(&mut self) -> Result<(), BackendError>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps everything in a byte vector. Nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    bytes: Vec<u8>,
    syncs: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of completed `sync` calls.
    pub fn syncs(&self) -> usize {
        self.syncs
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&mut self, offset: u64, size: usize) -> Result<Vec<u8>, BackendError> {
        let start = offset as usize;
        self.bytes
            .get(start..start + size)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                BackendError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("read of {size} bytes at {offset} past the end"),
                ))
            })
    }

    fn flush(&mut self, offset: u64, bytes: &[u8]) -> Result<(), BackendError> {
        let start = offset as usize;
        let end = start + bytes.len();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        self.syncs += 1;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Positioned, buffered I/O on a single file.
#[derive(Debug)]
pub struct FileBackend {
    reader: BufReader<File>,
    writer: BufWriter<File>,
    len: u64,
}

impl FileBackend {
    /// Opens (or creates) the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        let len = f.metadata()?.len();
        let reader = BufReader::new(f.try_clone()?);
        let writer = BufWriter::new(f);
        trace!("opened {} ({len} bytes)", path.as_ref().display());

        Ok(Self {
            reader,
            writer,
            len,
        })
    }
}

impl StorageBackend for FileBackend {
    fn read(&mut self, offset: u64, size: usize) -> Result<Vec<u8>, BackendError> {
        // pending writes must be visible to the reader handle
        self.writer.flush()?;

        let mut buf = vec![0; size];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn flush(&mut self, offset: u64, bytes: &[u8]) -> Result<(), BackendError> {
        self.writer.seek(SeekFrom::Start(offset))?;
        self.writer.write_all(bytes)?;
        self.len = self.len.max(offset + bytes.len() as u64);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}
