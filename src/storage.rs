//! Disk storage: the torrent's files addressed as one contiguous byte
//! space.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use crate::metainfo::FileItem;

/// Errors from the storage backend. Any of these is fatal to the
/// torrent that owns the store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("access of {length} bytes at {offset} is outside the torrent")]
    OutOfBounds { offset: u64, length: usize },
}

struct StoreFile {
    path: PathBuf,
    offset: u64,
    length: u64,
    handle: Mutex<Option<File>>,
}

/// The files of one torrent, read and written by global byte offset.
///
/// Pieces address the concatenation of all files; a read or write may
/// span file boundaries. Handles open lazily and stay open.
pub struct FileStore {
    files: Vec<StoreFile>,
    total_length: u64,
}

impl FileStore {
    /// Lays out the store under `base`; nothing touches the disk yet.
    pub fn new(base: &Path, files: &[FileItem]) -> Self {
        let files: Vec<StoreFile> = files
            .iter()
            .map(|f| StoreFile {
                path: base.join(&f.path),
                offset: f.offset,
                length: f.length,
                handle: Mutex::new(None),
            })
            .collect();
        let total_length = files.iter().map(|f| f.length).sum();
        Self {
            files,
            total_length,
        }
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Creates directories and sizes every file sparsely.
    ///
    /// Returns `true` when existing non-empty content was found, in
    /// which case the caller must hash-check the disk before trusting
    /// any resume state.
    pub async fn allocate(&self) -> Result<bool, StorageError> {
        let mut existing = false;
        for index in 0..self.files.len() {
            existing |= self.allocate_file(index).await?;
        }
        Ok(existing)
    }

    /// Allocates a single file; see [`FileStore::allocate`].
    pub async fn allocate_file(&self, index: usize) -> Result<bool, StorageError> {
        let f = &self.files[index];
        if let Some(parent) = f.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let existing = match tokio::fs::metadata(&f.path).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&f.path)
            .await?;
        file.set_len(f.length).await?;
        *f.handle.lock().await = Some(file);
        Ok(existing)
    }

    /// Reads `length` bytes at global `offset`, spanning files as needed.
    pub async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        self.check_bounds(offset, length)?;
        let mut out = BytesMut::zeroed(length);
        let mut filled = 0;
        while filled < length {
            let pos = offset + filled as u64;
            let f = self.file_at(pos)?;
            let within = pos - f.offset;
            let n = ((f.length - within) as usize).min(length - filled);

            let mut guard = f.handle.lock().await;
            let file = self.open(f, &mut guard).await?;
            file.seek(SeekFrom::Start(within)).await?;
            file.read_exact(&mut out[filled..filled + n]).await?;
            filled += n;
        }
        Ok(out.freeze())
    }

    /// Writes `data` at global `offset`, spanning files as needed.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.check_bounds(offset, data.len())?;
        let mut written = 0;
        while written < data.len() {
            let pos = offset + written as u64;
            let f = self.file_at(pos)?;
            let within = pos - f.offset;
            let n = ((f.length - within) as usize).min(data.len() - written);

            let mut guard = f.handle.lock().await;
            let file = self.open(f, &mut guard).await?;
            file.seek(SeekFrom::Start(within)).await?;
            file.write_all(&data[written..written + n]).await?;
            file.flush().await?;
            written += n;
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, length: usize) -> Result<(), StorageError> {
        let end = offset.checked_add(length as u64);
        match end {
            Some(end) if end <= self.total_length => Ok(()),
            _ => Err(StorageError::OutOfBounds { offset, length }),
        }
    }

    fn file_at(&self, pos: u64) -> Result<&StoreFile, StorageError> {
        // Zero-length files never own a byte position.
        self.files
            .iter()
            .find(|f| pos >= f.offset && pos < f.offset + f.length)
            .ok_or(StorageError::OutOfBounds {
                offset: pos,
                length: 0,
            })
    }

    async fn open<'a>(
        &self,
        f: &StoreFile,
        guard: &'a mut Option<File>,
    ) -> Result<&'a mut File, StorageError> {
        if guard.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&f.path)
                .await?;
            *guard = Some(file);
        }
        Ok(guard.as_mut().expect("handle just filled"))
    }
}
