//! Where a bridge-side transfer reads its image from.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

/// A read-only image file.
pub trait ImageFile: Read + Send {
    /// Total size in bytes.
    fn size(&self) -> usize;
}

/// A file on the local file system.
pub struct FsImageFile {
    file: File,
    size: usize,
}

impl FsImageFile {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len() as usize;
        Ok(Self { file, size })
    }
}

impl Read for FsImageFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ImageFile for FsImageFile {
    fn size(&self) -> usize {
        self.size
    }
}

/// Image bytes for one transfer.
///
/// A memory image is shared with the request that supplied it; a file is
/// owned and closed when the source is dropped.
pub enum ImageSource {
    Memory(Arc<[u8]>),
    File(Box<dyn ImageFile>),
}

impl ImageSource {
    pub fn memory(data: impl Into<Arc<[u8]>>) -> Self {
        ImageSource::Memory(data.into())
    }

    pub fn file(file: impl ImageFile + 'static) -> Self {
        ImageSource::File(Box::new(file))
    }

    pub fn len(&self) -> usize {
        match self {
            ImageSource::Memory(data) => data.len(),
            ImageSource::File(file) => file.size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::Memory(data) => write!(f, "Memory({} bytes)", data.len()),
            ImageSource::File(file) => write!(f, "File({} bytes)", file.size()),
        }
    }
}

/// Sequential reader over an [`ImageSource`] with byte accounting.
#[derive(Debug)]
pub struct ImageStream {
    source: ImageSource,
    total: usize,
    remaining: usize,
}

impl ImageStream {
    pub fn new(source: ImageSource) -> Self {
        let total = source.len();
        Self {
            source,
            total,
            remaining: total,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Fill `buf` with the next bytes of the image, returning how many were
    /// read. Fewer than `buf.len()` only at the end of the image.
    pub fn read_next(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.remaining);
        let offset = self.total - self.remaining;
        match &mut self.source {
            ImageSource::Memory(data) => buf[..n].copy_from_slice(&data[offset..offset + n]),
            ImageSource::File(file) => file.read_exact(&mut buf[..n])?,
        }
        self.remaining -= n;
        Ok(n)
    }
}
