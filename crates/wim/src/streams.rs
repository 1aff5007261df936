//! The archive's stream table: one deduplicated entry per distinct data
//! stream, keyed by SHA-1.

use std::collections::HashMap;
use std::path::PathBuf;

use wim_dtyp::Sha1Hash;

/// Index of a [`StreamDescriptor`] within a [`StreamTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) u32);

impl StreamId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Compression applied to an in-archive resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Xpress,
    Lzx,
}

/// Where a stream's bytes currently live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLocation {
    /// A resource inside the WIM container.
    InWim {
        offset: u64,
        /// Stored (possibly compressed) size of the resource.
        stored_size: u64,
        compression: Compression,
    },
    /// A plain file on disk holding the uncompressed bytes, e.g. a spill
    /// file written during pipe extraction.
    OnDisk(PathBuf),
    /// Not yet located; pipe extraction fills this in when the stream's
    /// header arrives.
    Pending,
}

impl StreamLocation {
    /// In-archive offset, used to order sequential reads.
    pub fn wim_offset(&self) -> Option<u64> {
        match self {
            StreamLocation::InWim { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

/// A reference from an inode's stream slot to the stream's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamRef {
    /// No stream (empty file, or an ADS entry with no contents).
    #[default]
    Empty,
    /// Known only by digest; resolved against the stream table per
    /// operation.
    ByHash(Sha1Hash),
    /// Pre-resolved by the container parser.
    Resolved(StreamId),
}

/// A deduplicated content entry.
///
/// Extraction-scoped bookkeeping (reference counts, dentry back-pointer
/// lists, location overrides) deliberately does not live here; it belongs
/// to the operation and is dropped when the operation ends. The one
/// exception is [`extracted_file`](Self::extracted_file), which must
/// survive across the images of a single linked multi-image extraction.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub hash: Sha1Hash,
    /// Uncompressed size in bytes.
    pub size: u64,
    pub location: StreamLocation,
    /// Path of the first extracted copy, recorded in hard-link and
    /// symlink extraction modes so later dentries can link to it.
    pub extracted_file: Option<String>,
}

impl StreamDescriptor {
    pub fn new(hash: Sha1Hash, size: u64, location: StreamLocation) -> Self {
        Self {
            hash,
            size,
            location,
            extracted_file: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamTable {
    entries: Vec<StreamDescriptor>,
    by_hash: HashMap<Sha1Hash, StreamId>,
}

impl StreamTable {
    /// Inserts a descriptor, deduplicating by hash. An existing entry for
    /// the same digest wins.
    pub fn insert(&mut self, descriptor: StreamDescriptor) -> StreamId {
        if let Some(&id) = self.by_hash.get(&descriptor.hash) {
            return id;
        }
        let id = StreamId(self.entries.len() as u32);
        self.by_hash.insert(descriptor.hash, id);
        self.entries.push(descriptor);
        id
    }

    pub fn lookup(&self, hash: &Sha1Hash) -> Option<StreamId> {
        self.by_hash.get(hash).copied()
    }

    pub fn get(&self, id: StreamId) -> &StreamDescriptor {
        &self.entries[id.index()]
    }

    pub fn get_mut(&mut self, id: StreamId) -> &mut StreamDescriptor {
        &mut self.entries[id.index()]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamId, &StreamDescriptor)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, d)| (StreamId(i as u32), d))
    }

    /// Drops the linked-extraction paths recorded on descriptors. Called
    /// by the extraction entry points once a linked operation completes.
    pub fn clear_extracted_files(&mut self) {
        for entry in &mut self.entries {
            entry.extracted_file = None;
        }
    }
}
