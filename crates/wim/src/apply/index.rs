//! The stream index: which distinct streams the operation must read, how
//! many dentry slots each must satisfy, and (for sequential extraction)
//! which dentries those are.

use crate::apply::ApplyContext;
use crate::image::DentryId;
use crate::streams::{StreamDescriptor, StreamId, StreamLocation, StreamRef};
use crate::{Error, Result};

/// Dentries referencing a stream. Most streams have very few references,
/// so a small inline array is used until it fills, then the list moves to
/// the heap and grows geometrically.
#[derive(Debug)]
pub(crate) enum DentryList {
    Inline {
        buf: [DentryId; Self::INLINE_CAPACITY],
        len: u8,
    },
    Heap(Vec<DentryId>),
}

impl DentryList {
    const INLINE_CAPACITY: usize = 4;

    pub fn push(&mut self, dentry: DentryId) {
        match self {
            DentryList::Inline { buf, len } => {
                if (*len as usize) < Self::INLINE_CAPACITY {
                    buf[*len as usize] = dentry;
                    *len += 1;
                } else {
                    let mut heap = Vec::with_capacity(Self::INLINE_CAPACITY * 2);
                    heap.extend_from_slice(buf);
                    heap.push(dentry);
                    *self = DentryList::Heap(heap);
                }
            }
            DentryList::Heap(heap) => {
                if heap.len() == heap.capacity() {
                    heap.reserve_exact(heap.capacity());
                }
                heap.push(dentry);
            }
        }
    }

    pub fn as_slice(&self) -> &[DentryId] {
        match self {
            DentryList::Inline { buf, len } => &buf[..*len as usize],
            DentryList::Heap(heap) => heap,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }
}

impl Default for DentryList {
    fn default() -> Self {
        DentryList::Inline {
            buf: [DentryId(0); Self::INLINE_CAPACITY],
            len: 0,
        }
    }
}

/// First pass: resolve every unskipped inode's stream references against
/// the stream table. When extracting from a pipe the table starts empty,
/// so descriptors are synthesized from the digests; their locations are
/// filled in as the matching headers arrive.
pub(crate) fn resolve_streams(ctx: &mut ApplyContext<'_, '_>) -> Result<()> {
    let image = ctx.image;
    image.walk_pre(ctx.root, &mut |image, id| {
        if ctx.dentry_scratch(id).skipped {
            return Ok(());
        }
        let inode_id = image.dentry(id).inode;
        if !ctx.inode_scratch[inode_id.index()].streams.is_empty() {
            return Ok(());
        }
        let inode = image.inode(inode_id);
        let mut resolved = Vec::with_capacity(1 + inode.ads.len());
        resolved.push(resolve_ref(ctx, &inode.unnamed_stream)?);
        for entry in &inode.ads {
            resolved.push(resolve_ref(ctx, &entry.stream)?);
        }
        ctx.inode_scratch[inode_id.index()].streams = resolved;
        Ok(())
    })
}

fn resolve_ref(ctx: &mut ApplyContext<'_, '_>, stream: &StreamRef) -> Result<Option<StreamId>> {
    match stream {
        StreamRef::Empty => Ok(None),
        StreamRef::Resolved(id) => Ok(Some(*id)),
        StreamRef::ByHash(hash) => {
            if let Some(id) = ctx.streams.lookup(hash) {
                return Ok(Some(id));
            }
            if ctx.flags.from_pipe {
                // Size and location are learned when the stream arrives.
                let id = ctx.streams.insert(StreamDescriptor::new(
                    *hash,
                    0,
                    StreamLocation::Pending,
                ));
                return Ok(Some(id));
            }
            Err(Error::InvalidImage(format!(
                "stream {hash} is referenced by the image but missing from the archive"
            )))
        }
    }
}

/// Second pass: count the dentry slots each stream must satisfy and put
/// each needed stream on the operation's list exactly once. Hard-linked
/// dentries are visited once when the volume supports hard links, since
/// the other links are realized without reading data.
pub(crate) fn build_stream_index(ctx: &mut ApplyContext<'_, '_>) -> Result<()> {
    let image = ctx.image;
    image.walk_pre(ctx.root, &mut |image, id| {
        if ctx.dentry_scratch(id).skipped {
            return Ok(());
        }
        let inode_id = image.dentry(id).inode;
        if ctx.inode_scratch[inode_id.index()].visited && ctx.caps.hard_links {
            return Ok(());
        }
        let inode = image.inode(inode_id);

        if !inode.is_encrypted_directory() {
            if let Some(stream) = ctx.unnamed_stream(id) {
                ref_stream(ctx, stream, id);
            }
        }
        if ctx.can_extract_named_streams() {
            for (i, entry) in inode.ads.iter().enumerate() {
                if !entry.is_named() {
                    continue;
                }
                if let Some(stream) = ctx.ads_stream(id, i) {
                    ref_stream(ctx, stream, id);
                }
            }
        }
        ctx.inode_scratch[inode_id.index()].visited = true;
        Ok(())
    })
}

/// Accounts for one dentry slot needing `stream`.
fn ref_stream(ctx: &mut ApplyContext<'_, '_>, stream: StreamId, dentry: DentryId) {
    let descriptor = ctx.streams.get(stream);
    let scratch = &mut ctx.stream_scratch[stream.index()];

    // In linked modes, a stream already materialized (possibly by an
    // earlier image of the same operation) costs nothing further.
    if !ctx.flags.is_linked() || (scratch.refcnt == 0 && descriptor.extracted_file.is_none()) {
        ctx.progress.info.total_bytes += descriptor.size;
        ctx.progress.info.num_streams += 1;
    }

    if scratch.refcnt == 0 {
        ctx.stream_list.push(stream);
        ctx.num_streams_remaining += 1;
    }

    if ctx.flags.sequential {
        scratch.dentries.push(dentry);
    }
    scratch.refcnt += 1;
}
