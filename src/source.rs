//! Read-only access to the bytes being uploaded.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Source bytes of one transfer. Owned by the caller; the engine only reads.
#[async_trait]
pub trait ContentSource: Send + Sync + std::fmt::Debug {
    /// Size in bytes at the time the handle was created.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads exactly `len` bytes starting at `offset`.
    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Bytes>;

    /// Backing file, when there is one. Only such tasks can be persisted.
    fn local_path(&self) -> Option<&Path> {
        None
    }
}

pub type ContentHandle = Arc<dyn ContentSource>;

fn out_of_bounds(offset: u64, len: u64, size: u64) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("range {offset}+{len} exceeds content size {size}"),
    )
}

// --- FILE ---

/// A file on the local filesystem, re-opened for every read.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Stats `path` and captures its current size.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, size })
    }

    /// For callers that already know the size (e.g. from a directory listing).
    pub fn with_size(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

#[async_trait]
impl ContentSource for FileSource {
    fn len(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Bytes> {
        if offset.saturating_add(len) > self.size {
            return Err(out_of_bounds(offset, len, self.size));
        }
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

// --- MEMORY ---

/// In-memory content, e.g. pasted data or test fixtures.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Bytes> {
        let size = self.len();
        if offset.saturating_add(len) > size {
            return Err(out_of_bounds(offset, len, size));
        }
        Ok(self.data.slice(offset as usize..(offset + len) as usize))
    }
}
