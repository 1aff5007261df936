//! Shared fixtures for the integration suites: a recording applicator, an
//! in-memory archive source that logs its read order, and a builder for
//! small test archives.

// Each integration binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Read};

use wim::backend::{Applicator, BackendOptions, StreamFeed, UnixData, VolumeCapabilities};
use wim::source::WimSource;
use wim::streams::{Compression, StreamDescriptor, StreamLocation, StreamRef};
use wim::{
    AdsEntry, DentryId, Error, FileAttributes, FileTime, Image, Inode, InodeId, ReparseTag,
    Result, Sha1Hash, WideString, WimArchive,
};
use wim_fscc::ReparseData;

/// Everything the engine asked a [`MockApplicator`] to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start(String),
    CreateDir(String),
    CreateFile(String),
    HardLink { old: String, new: String },
    Symlink { target: String, link: String },
    UnnamedStream { path: String, data: Vec<u8> },
    NamedStream { path: String, name: String, data: Option<Vec<u8>> },
    EncryptedStream { path: String, data: Vec<u8> },
    ReparseData { path: String, buf: Vec<u8> },
    Attributes { path: String, bits: u32 },
    ShortName { path: String, name: String },
    SecurityDescriptor { path: String, descriptor: Vec<u8> },
    SetUnixData { path: String, data: UnixData },
    Timestamps { path: String, write: u64 },
    Abort,
    Finish,
}

/// An applicator that materializes nothing and records everything.
pub struct MockApplicator {
    pub options: BackendOptions,
    pub caps: VolumeCapabilities,
    pub calls: Vec<Call>,
}

impl MockApplicator {
    /// A plain volume: hard links, timestamps, case-sensitive names.
    pub fn basic() -> Self {
        Self {
            options: BackendOptions::default(),
            caps: VolumeCapabilities {
                hard_links: true,
                timestamps: true,
                case_sensitive_filenames: true,
                ..Default::default()
            },
            calls: Vec::new(),
        }
    }

    pub fn paths_of(&self, f: impl Fn(&Call) -> Option<&str>) -> Vec<String> {
        self.calls.iter().filter_map(|c| f(c).map(String::from)).collect()
    }

    /// Index of the first call matching `pred`; panics when absent.
    pub fn index_of(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls
            .iter()
            .position(pred)
            .unwrap_or_else(|| panic!("expected call not found in {:#?}", self.calls))
    }

    pub fn count_of(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn unnamed_writes(&self) -> Vec<(String, Vec<u8>)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::UnnamedStream { path, data } => Some((path.clone(), data.clone())),
                _ => None,
            })
            .collect()
    }
}

fn read_feed(feed: &mut StreamFeed<'_>) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(feed.size() as usize);
    feed.read_to_end(&mut data).map_err(Error::Read)?;
    Ok(data)
}

impl Applicator for MockApplicator {
    fn options(&self) -> &BackendOptions {
        &self.options
    }

    fn capabilities(&self) -> &VolumeCapabilities {
        &self.caps
    }

    fn start(&mut self, target: &str) -> Result<()> {
        self.calls.push(Call::Start(target.to_string()));
        Ok(())
    }

    fn create_directory(&mut self, path: &str) -> Result<()> {
        self.calls.push(Call::CreateDir(path.to_string()));
        Ok(())
    }

    fn create_file(&mut self, path: &str) -> Result<()> {
        self.calls.push(Call::CreateFile(path.to_string()));
        Ok(())
    }

    fn create_hard_link(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.calls.push(Call::HardLink {
            old: old_path.to_string(),
            new: new_path.to_string(),
        });
        Ok(())
    }

    fn create_symlink(&mut self, target: &str, link_path: &str) -> Result<()> {
        self.calls.push(Call::Symlink {
            target: target.to_string(),
            link: link_path.to_string(),
        });
        Ok(())
    }

    fn extract_unnamed_stream(&mut self, path: &str, stream: &mut StreamFeed<'_>) -> Result<()> {
        let data = read_feed(stream)?;
        self.calls.push(Call::UnnamedStream {
            path: path.to_string(),
            data,
        });
        Ok(())
    }

    fn extract_named_stream(
        &mut self,
        path: &str,
        name: &WideString,
        stream: Option<&mut StreamFeed<'_>>,
    ) -> Result<()> {
        let data = match stream {
            Some(feed) => Some(read_feed(feed)?),
            None => None,
        };
        self.calls.push(Call::NamedStream {
            path: path.to_string(),
            name: name.to_string_lossy(),
            data,
        });
        Ok(())
    }

    fn extract_encrypted_stream(&mut self, path: &str, stream: &mut StreamFeed<'_>) -> Result<()> {
        let data = read_feed(stream)?;
        self.calls.push(Call::EncryptedStream {
            path: path.to_string(),
            data,
        });
        Ok(())
    }

    fn set_reparse_data(&mut self, path: &str, reparse_buffer: &[u8]) -> Result<()> {
        self.calls.push(Call::ReparseData {
            path: path.to_string(),
            buf: reparse_buffer.to_vec(),
        });
        Ok(())
    }

    fn set_file_attributes(&mut self, path: &str, attributes: FileAttributes) -> Result<()> {
        self.calls.push(Call::Attributes {
            path: path.to_string(),
            bits: attributes.bits(),
        });
        Ok(())
    }

    fn set_short_name(&mut self, path: &str, short_name: &WideString) -> Result<()> {
        self.calls.push(Call::ShortName {
            path: path.to_string(),
            name: short_name.to_string_lossy(),
        });
        Ok(())
    }

    fn set_security_descriptor(&mut self, path: &str, descriptor: &[u8], _strict: bool) -> Result<()> {
        self.calls.push(Call::SecurityDescriptor {
            path: path.to_string(),
            descriptor: descriptor.to_vec(),
        });
        Ok(())
    }

    fn set_unix_data(&mut self, path: &str, data: &UnixData) -> Result<()> {
        self.calls.push(Call::SetUnixData {
            path: path.to_string(),
            data: *data,
        });
        Ok(())
    }

    fn set_timestamps(
        &mut self,
        path: &str,
        _creation: FileTime,
        last_write: FileTime,
        _last_access: FileTime,
    ) -> Result<()> {
        self.calls.push(Call::Timestamps {
            path: path.to_string(),
            write: *last_write,
        });
        Ok(())
    }

    fn abort(&mut self) {
        self.calls.push(Call::Abort);
    }

    fn finish(&mut self) -> Result<()> {
        self.calls.push(Call::Finish);
        Ok(())
    }
}

/// Serves uncompressed in-archive resources from memory, recording the
/// order of offsets read.
pub struct MemorySource {
    data: HashMap<u64, Vec<u8>>,
    pub reads: Vec<u64>,
    /// Claim seekability or not; a non-seekable claim makes the engine
    /// spill multi-reference streams instead of re-reading.
    pub seekable: bool,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self {
            data: HashMap::new(),
            reads: Vec::new(),
            seekable: true,
        }
    }
}

impl MemorySource {
    pub fn insert(&mut self, offset: u64, data: Vec<u8>) {
        self.data.insert(offset, data);
    }
}

impl WimSource for MemorySource {
    fn can_seek(&self) -> bool {
        self.seekable
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
                self.reads.push(*offset);
                let data = self
                    .data
                    .get(offset)
                    .unwrap_or_else(|| panic!("no stream registered at offset {offset}"));
                assert_eq!(data.len() as u64, size);
                Ok(Box::new(Cursor::new(data.clone())))
            }
            _ => Err(Error::InvalidParam("memory source serves only raw resources")),
        }
    }
}

/// A small archive under construction: one or more images plus the
/// stream table and an in-memory source backing it.
pub struct Fixture {
    pub archive: WimArchive,
    pub source: MemorySource,
    next_offset: u64,
}

/// A directory inode with fixed timestamps.
pub fn dir_inode() -> Inode {
    Inode {
        attributes: FileAttributes::new().with_directory(true),
        creation_time: FileTime::from(130_000_000_000_000_000),
        last_write_time: FileTime::from(130_000_000_000_000_001),
        last_access_time: FileTime::from(130_000_000_000_000_002),
        ..Default::default()
    }
}

impl Fixture {
    pub fn new() -> Self {
        let mut archive = WimArchive::default();
        archive.images.push(Image::new(dir_inode()));
        Self {
            archive,
            source: MemorySource::default(),
            next_offset: 1000,
        }
    }

    pub fn image(&mut self) -> &mut Image {
        &mut self.archive.images[0]
    }

    pub fn root(&mut self) -> DentryId {
        self.image().root()
    }

    /// Registers stream contents at the next archive offset.
    pub fn stream(&mut self, data: &[u8]) -> StreamRef {
        self.stream_at(self.next_offset, data)
    }

    /// Registers stream contents at a chosen archive offset.
    pub fn stream_at(&mut self, offset: u64, data: &[u8]) -> StreamRef {
        self.next_offset = self.next_offset.max(offset) + 1000;
        let hash = Sha1Hash::of(data);
        self.archive.streams.insert(StreamDescriptor::new(
            hash,
            data.len() as u64,
            StreamLocation::InWim {
                offset,
                stored_size: data.len() as u64,
                compression: Compression::None,
            },
        ));
        self.source.insert(offset, data.to_vec());
        StreamRef::ByHash(hash)
    }

    pub fn file_inode(&mut self, data: &[u8]) -> InodeId {
        let stream = self.stream(data);
        self.image().add_inode(Inode {
            unnamed_stream: stream,
            creation_time: FileTime::from(131_000_000_000_000_000),
            last_write_time: FileTime::from(131_000_000_000_000_001),
            last_access_time: FileTime::from(131_000_000_000_000_002),
            ..Default::default()
        })
    }

    pub fn add_file(&mut self, parent: DentryId, name: &str, data: &[u8]) -> DentryId {
        let inode = self.file_inode(data);
        self.image().add_child(parent, name, inode)
    }

    pub fn add_dir(&mut self, parent: DentryId, name: &str) -> DentryId {
        let inode = self.image().add_inode(dir_inode());
        self.image().add_child(parent, name, inode)
    }

    pub fn add_ads(&mut self, dentry: DentryId, name: &str, data: Option<&[u8]>) {
        let stream = match data {
            Some(data) => self.stream(data),
            None => StreamRef::Empty,
        };
        let image = self.image();
        let inode_id = image.dentry(dentry).inode;
        // The builder APIs hand out ids, not &mut Inode; tests reach in
        // through a dedicated mutator.
        image.inode_mut(inode_id).ads.push(AdsEntry {
            name: WideString::from(name),
            stream,
        });
    }

    /// Adds a symlink whose reparse stream encodes `substitute`.
    pub fn add_symlink(&mut self, parent: DentryId, name: &str, substitute: &str) -> DentryId {
        let print = substitute
            .strip_prefix("\\??\\")
            .unwrap_or(substitute)
            .to_string();
        let full = ReparseData {
            tag: ReparseTag::SYMLINK,
            substitute_name: WideString::from(substitute),
            print_name: WideString::from(print),
            flags: 0,
        }
        .to_bytes()
        .unwrap();
        // The archive stores the data portion; the tag lives in the inode.
        let stream = self.stream(&full[8..]);
        let inode = self.image().add_inode(Inode {
            attributes: FileAttributes::new().with_reparse_point(true),
            reparse_tag: ReparseTag::SYMLINK,
            unnamed_stream: stream,
            ..Default::default()
        });
        self.image().add_child(parent, name, inode)
    }
}
