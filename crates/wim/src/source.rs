//! Byte sources for stream data.
//!
//! The engine reads stream contents through [`WimSource`]. Only in-archive
//! locations go through the trait; spill files and other on-disk locations
//! are opened by the engine itself. The bundled [`FileSource`] serves
//! uncompressed resources from a seekable file; decompressing sources are
//! supplied by the container/decompressor layer.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha1::{Digest, Sha1};
use wim_dtyp::Sha1Hash;

use crate::pipe::PipeItem;
use crate::streams::{Compression, StreamLocation};
use crate::{Error, Result};

pub trait WimSource {
    /// Whether arbitrary streams can be revisited. Pipes cannot; the
    /// engine spills multi-reference streams to temporary files for them.
    fn can_seek(&self) -> bool;

    /// Opens a reader over the uncompressed bytes of an in-archive
    /// resource.
    fn open_stream<'a>(
        &'a mut self,
        location: &StreamLocation,
        size: u64,
    ) -> Result<Box<dyn Read + 'a>>;

    /// Advances a pipable source to its next element. Non-pipe sources
    /// refuse.
    fn next_pipe_item(&mut self) -> Result<PipeItem> {
        Err(Error::NotPipable)
    }

    /// Discards the body of an unneeded pipable stream.
    fn skip_stream(&mut self, size: u64) -> Result<()> {
        let _ = size;
        Err(Error::NotPipable)
    }
}

/// Serves raw (uncompressed) resources from a seekable WIM file.
pub struct FileSource {
    file: File,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl WimSource for FileSource {
    fn can_seek(&self) -> bool {
        true
    }

    fn open_stream<'a>(
        &'a mut self,
        location: &StreamLocation,
        size: u64,
    ) -> Result<Box<dyn Read + 'a>> {
        match location {
            StreamLocation::InWim {
                offset,
                compression: Compression::None,
                ..
            } => {
                self.file
                    .seek(SeekFrom::Start(*offset))
                    .map_err(Error::Read)?;
                Ok(Box::new((&mut self.file).take(size)))
            }
            StreamLocation::InWim { .. } => Err(Error::Unsupported(
                "compressed resources require a decompressing source".into(),
            )),
            _ => Err(Error::InvalidParam(
                "only in-archive locations are served by a WIM source",
            )),
        }
    }
}

/// Opens a reader for any stream location, routing in-archive locations
/// through the source and on-disk locations through the filesystem.
pub(crate) fn open_location<'a>(
    source: &'a mut dyn WimSource,
    location: &StreamLocation,
    size: u64,
) -> Result<Box<dyn Read + 'a>> {
    match location {
        StreamLocation::OnDisk(path) => {
            let file = File::open(path).map_err(|source| Error::Open {
                path: path.clone(),
                source,
            })?;
            Ok(Box::new(file.take(size)))
        }
        StreamLocation::Pending => Err(Error::InvalidParam(
            "stream has no located contents yet",
        )),
        StreamLocation::InWim { .. } => source.open_stream(location, size),
    }
}

/// Hashes bytes as they flow through, so the engine can confirm a fully
/// consumed stream against its recorded digest.
pub(crate) struct HashingReader<'a> {
    inner: Box<dyn Read + 'a>,
    hasher: Sha1,
    bytes_read: u64,
}

impl<'a> HashingReader<'a> {
    pub fn new(inner: Box<dyn Read + 'a>) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Checks the digest of everything read. Only meaningful once the
    /// stream was consumed to its full size.
    pub fn verify(self, expected: &Sha1Hash) -> Result<()> {
        let actual = Sha1Hash(self.hasher.finalize().into());
        if actual == *expected {
            Ok(())
        } else {
            Err(Error::StreamHashMismatch {
                hash: *expected,
                actual,
            })
        }
    }
}

impl Read for HashingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}
