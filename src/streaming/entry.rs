//! Entries: the normalized input of an add operation.
//!
//! Producers here are lazy and single-pass. `normalize_path` walks a local
//! tree on a blocking thread and streams entries through a bounded channel,
//! opening each file only when its content is first polled.

use crate::error::{IngestError, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// Capacity of the walker -> consumer entry channel
pub const ENTRY_CHANNEL_SIZE: usize = 1024;

/// Lazy sequence of content chunks for one file
pub type ChunkStream = BoxStream<'static, io::Result<Bytes>>;

/// Lazy sequence of entries, may fail mid-way
pub type EntryStream = BoxStream<'static, Result<Entry>>;

/// Modification time with nanosecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct Mtime {
    pub secs: i64,
    pub nsecs: u32,
}

impl Mtime {
    pub fn new(secs: i64, nsecs: u32) -> Self {
        Self { secs, nsecs }
    }

    pub fn from_metadata(meta: &Metadata) -> Option<Self> {
        meta.modified().ok().map(Self::from_system_time)
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(before) => {
                // Pre-epoch: keep nsecs non-negative
                let d = before.duration();
                if d.subsec_nanos() == 0 {
                    Self::new(-(d.as_secs() as i64), 0)
                } else {
                    Self::new(-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        }
    }
}

pub enum EntryBody {
    Directory,
    File(ChunkStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One file or directory submitted for ingestion
pub struct Entry {
    pub path: String,
    pub mode: Option<u32>,
    pub mtime: Option<Mtime>,
    pub body: EntryBody,
}

impl Entry {
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: None,
            mtime: None,
            body: EntryBody::Directory,
        }
    }

    pub fn file(path: impl Into<String>, content: ChunkStream) -> Self {
        Self {
            path: path.into(),
            mode: None,
            mtime: None,
            body: EntryBody::File(content),
        }
    }

    /// File whose content is already in memory, one chunk per element
    pub fn file_from_chunks<I, B>(path: impl Into<String>, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks: Vec<io::Result<Bytes>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self::file(path, stream::iter(chunks).boxed())
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_mtime(mut self, mtime: Mtime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn kind(&self) -> EntryKind {
        match self.body {
            EntryBody::Directory => EntryKind::Directory,
            EntryBody::File(_) => EntryKind::File,
        }
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("path", &self.path)
            .field("kind", &self.kind())
            .field("mode", &self.mode)
            .field("mtime", &self.mtime)
            .finish()
    }
}

// =============================================================================
// Producers
// =============================================================================

pub fn entries_from_iter<I>(entries: I) -> EntryStream
where
    I: IntoIterator<Item = Entry>,
    I::IntoIter: Send + 'static,
{
    stream::iter(entries.into_iter().map(Ok)).boxed()
}

/// Read a local file lazily in `chunk_size` pieces.
/// The file is opened on first poll.
pub fn file_chunks(path: PathBuf, chunk_size: usize) -> ChunkStream {
    let chunk_size = chunk_size.max(1);
    stream::try_unfold((path, None::<File>), move |(path, file)| async move {
        let mut file = match file {
            Some(f) => f,
            None => File::open(&path).await?,
        };
        let mut buf = BytesMut::with_capacity(chunk_size);
        while buf.len() < chunk_size {
            let n = file.read_buf(&mut buf).await?;
            if n == 0 {
                break;
            }
        }
        if buf.is_empty() {
            return Ok::<_, io::Error>(None);
        }
        Ok(Some((buf.freeze(), (path, Some(file)))))
    })
    .boxed()
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_meta: &Metadata) -> Option<u32> {
    None
}

fn display_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk a local file or directory and stream its entries.
///
/// Entry paths are relative to the parent of `root`, so adding `photos/`
/// yields `photos`, `photos/a.jpg`, ... Directories come before their
/// children; siblings are sorted by name.
pub fn normalize_path(root: impl Into<PathBuf>, chunk_size: usize) -> EntryStream {
    let root: PathBuf = root.into();

    // The walk starts on first poll
    stream::once(async move {
        let (tx, rx) = mpsc::channel::<Result<Entry>>(ENTRY_CHANNEL_SIZE);
        tokio::task::spawn_blocking(move || walk_root(&root, chunk_size, tx));
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
    })
    .flatten()
    .boxed()
}

fn walk_root(root: &Path, chunk_size: usize, tx: mpsc::Sender<Result<Entry>>) {
    let base = root.parent().map(Path::to_path_buf).unwrap_or_default();
    let root_label = root.display().to_string();

    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    for item in walker {
        let entry = match item {
            Ok(dirent) => match entry_for(dirent.path(), &base, chunk_size) {
                Ok(Some(entry)) => Ok(entry),
                Ok(None) => {
                    tracing::debug!("Skipping special file {}", dirent.path().display());
                    continue;
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(IngestError::input(
                root_label.clone(),
                io::Error::new(io::ErrorKind::Other, e.to_string()),
            )),
        };
        let failed = entry.is_err();
        if tx.blocking_send(entry).is_err() {
            tracing::debug!("Entry consumer went away, stopping walk of {}", root_label);
            return;
        }
        if failed {
            return;
        }
    }
}

/// `None` for symlinks and special files, which are not ingested.
fn entry_for(path: &Path, base: &Path, chunk_size: usize) -> Result<Option<Entry>> {
    let rel = path.strip_prefix(base).unwrap_or(path);
    let label = display_path(rel);
    let meta = std::fs::symlink_metadata(path).map_err(|e| IngestError::input(label.clone(), e))?;

    let entry = if meta.is_dir() {
        Entry::directory(label)
    } else if meta.is_file() {
        Entry::file(label, file_chunks(path.to_path_buf(), chunk_size))
    } else {
        return Ok(None);
    };

    Ok(Some(Entry {
        mode: mode_of(&meta),
        mtime: Mtime::from_metadata(&meta),
        ..entry
    }))
}
