//! Lazy readers over object versions

use crate::diff::PhysicalRead;
use crate::error::{FormatError, Result};
use crate::obj_file::version_file_name;
use bytes::Bytes;
use futures::Stream;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Largest chunk a [`SegsSource`] yields at once.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// What part of a version to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadRequest {
    pub header: bool,
    pub segs_offset: u64,
    /// Maximum number of segment bytes; `None` reads to the end.
    pub segs_limit: Option<u64>,
}

impl ReadRequest {
    /// Header and every segment byte.
    pub fn whole() -> Self {
        Self {
            header: true,
            segs_offset: 0,
            segs_limit: None,
        }
    }

    /// Clamps the requested window to a stream of `total` bytes.
    pub(crate) fn clamp(&self, total: u64) -> (u64, u64) {
        let offset = self.segs_offset.min(total);
        let available = total - offset;
        let len = self.segs_limit.map_or(available, |limit| limit.min(available));
        (offset, len)
    }
}

/// A version opened for reading.
#[derive(Debug)]
pub struct ObjReader {
    pub version: u64,
    pub header: Option<Bytes>,
    /// Logical segment length of the whole version.
    pub segs_total: u64,
    pub segs: SegsSource,
}

/// Yields the bytes of a segment window in order.
///
/// Every version file the window touches is opened up front, so the window
/// stays readable after a later transaction removes those files.
#[derive(Debug)]
pub struct SegsSource {
    files: HashMap<u64, File>,
    reads: VecDeque<PhysicalRead>,
    remaining: u64,
    chunk_size: usize,
}

impl SegsSource {
    pub(crate) async fn open(obj_dir: &Path, reads: Vec<PhysicalRead>) -> Result<Self> {
        let mut files = HashMap::new();
        for read in &reads {
            if let Entry::Vacant(entry) = files.entry(read.version) {
                entry.insert(File::open(obj_dir.join(version_file_name(read.version))).await?);
            }
        }
        let remaining = reads.iter().map(|r| r.len).sum();
        Ok(Self {
            files,
            reads: reads.into(),
            remaining,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Bytes not yet yielded.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// The next chunk of bytes, `None` once the window is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(mut read) = self.reads.pop_front() else {
            return Ok(None);
        };
        let take = read.len.min(self.chunk_size as u64);
        if take < read.len {
            self.reads.push_front(PhysicalRead {
                version: read.version,
                pos: read.pos + take,
                len: read.len - take,
            });
            read.len = take;
        }

        let file = self.files.get_mut(&read.version).ok_or_else(|| {
            FormatError::Corrupt(format!("version {} was not opened", read.version))
        })?;
        file.seek(SeekFrom::Start(read.pos)).await?;
        let mut buf = vec![0u8; read.len as usize];
        file.read_exact(&mut buf).await?;
        self.remaining -= read.len;
        Ok(Some(Bytes::from(buf)))
    }

    /// Collects the whole window.
    pub async fn read_all(mut self) -> Result<Bytes> {
        let mut out = Vec::with_capacity(self.remaining as usize);
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send {
        futures::stream::try_unfold(self, |mut source| async move {
            Ok(source.next_chunk().await?.map(|chunk| (chunk, source)))
        })
    }
}
