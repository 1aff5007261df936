//! Stream extraction: moving stream bytes from the source into the
//! applicator, in whichever order the operation's strategy dictates, with
//! digest verification along the way.

use std::io::{Read, Write};

use log::{error, warn};

use crate::apply::{ApplyContext, path, reparse};
use crate::backend::StreamFeed;
use crate::image::{DentryId, Image};
use crate::pipe::PipeItem;
use crate::source::{HashingReader, WimSource, open_location};
use crate::streams::{Compression, StreamId, StreamLocation, StreamTable};
use crate::{Error, Result};
use wim_fscc::REPARSE_POINT_MAX_SIZE;

/// Feeds one stream's bytes to the applicator through `consume`,
/// draining any remainder (so sequential sources stay positioned) and
/// verifying the digest of what flowed past.
fn feed_stream(
    ctx: &mut ApplyContext<'_, '_>,
    stream: StreamId,
    relocated: Option<&StreamLocation>,
    consume: impl FnOnce(&mut dyn crate::Applicator, &mut StreamFeed<'_>) -> Result<()>,
) -> Result<()> {
    let descriptor = ctx.streams.get(stream);
    let size = descriptor.size;
    let hash = descriptor.hash;
    let location = relocated.unwrap_or(&descriptor.location).clone();

    let reader = open_location(&mut *ctx.source, &location, size)?;
    let mut hashing = HashingReader::new(reader);
    consume(&mut *ctx.backend, &mut StreamFeed::new(&mut hashing, size))?;
    std::io::copy(&mut hashing, &mut std::io::sink()).map_err(Error::Read)?;
    if hashing.bytes_read() != size {
        return Err(Error::Read(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if !hash.is_zero() {
        hashing.verify(&hash)?;
    }
    Ok(())
}

/// Reads one stream fully into memory, verifying its digest. Only used
/// for reparse data, which is bounded.
fn read_stream_bytes(
    ctx: &mut ApplyContext<'_, '_>,
    stream: StreamId,
    relocated: Option<&StreamLocation>,
) -> Result<Vec<u8>> {
    let descriptor = ctx.streams.get(stream);
    let size = descriptor.size;
    let hash = descriptor.hash;
    let location = relocated.unwrap_or(&descriptor.location).clone();

    let reader = open_location(&mut *ctx.source, &location, size)?;
    let mut hashing = HashingReader::new(reader);
    let mut data = Vec::with_capacity(size.min(REPARSE_POINT_MAX_SIZE as u64) as usize);
    hashing.read_to_end(&mut data).map_err(Error::Read)?;
    if hashing.bytes_read() != size {
        return Err(Error::Read(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if !hash.is_zero() {
        hashing.verify(&hash)?;
    }
    Ok(data)
}

/// Reassembles the full reparse buffer of a reparse-point inode: the
/// 8-byte header from inode metadata, the data portion from its stream.
fn read_reparse_buffer(
    ctx: &mut ApplyContext<'_, '_>,
    id: DentryId,
    relocated: Option<&StreamLocation>,
) -> Result<Vec<u8>> {
    let tag = ctx.image.inode_of(id).reparse_tag;
    let data = match ctx.unnamed_stream(id) {
        Some(stream) => read_stream_bytes(ctx, stream, relocated)?,
        None => Vec::new(),
    };
    if data.len() > REPARSE_POINT_MAX_SIZE - 8 {
        return Err(Error::InvalidReparseData(
            wim_fscc::FsccError::ReparseBufferTooLarge(8 + data.len()),
        ));
    }
    let mut buf = Vec::with_capacity(8 + data.len());
    buf.extend_from_slice(&tag.0.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&data);
    Ok(buf)
}

/// Realizes a symlink or junction natively, decoding the target from the
/// reparse buffer and (with fixup active) re-rooting absolute targets
/// under the resolved extraction target.
pub(crate) fn extract_symlink(
    ctx: &mut ApplyContext<'_, '_>,
    dentry_path: &str,
    id: DentryId,
    relocated: Option<&StreamLocation>,
) -> Result<()> {
    let buf = read_reparse_buffer(ctx, id, relocated)?;
    let realtarget = if ctx.flags.rpfix {
        ctx.realtarget.as_deref()
    } else {
        None
    };
    let target = reparse::symlink_target_from_buffer(&buf, realtarget)?;

    ctx.backend
        .create_symlink(&target, dentry_path)
        .inspect_err(|_| {
            error!("Failed to create symlink \"{dentry_path}\" => \"{target}\"");
        })?;

    let consumed = ctx
        .unnamed_stream(id)
        .map(|s| ctx.streams.get(s).size)
        .unwrap_or(0);
    ctx.progress.stream_completed(consumed);
    Ok(())
}

/// Applies reparse data to an extracted file, rewriting absolute
/// symlink/junction targets when fixup is active.
fn extract_reparse_data(
    ctx: &mut ApplyContext<'_, '_>,
    dentry_path: &str,
    id: DentryId,
    stream: StreamId,
    relocated: Option<&StreamLocation>,
) -> Result<()> {
    let inode = ctx.image.inode_of(id);
    let is_symlink = inode.is_symlink();
    let wants_fixup = ctx.flags.rpfix && inode.reparse_tag.is_link() && !inode.not_rpfixed;

    let mut buf = read_reparse_buffer(ctx, id, relocated)?;
    if wants_fixup {
        let realtarget = ctx.realtarget.clone().unwrap_or_default();
        match reparse::fixup_absolute_target(&buf, &realtarget) {
            Ok(Some(fixed)) => buf = fixed,
            Ok(None) => {}
            Err(e) => {
                if ctx.flags.strict_symlinks {
                    error!("Failed to fix the reparse point target of \"{dentry_path}\"");
                    return Err(e);
                }
                warn!("Reparse point fixup of \"{dentry_path}\" failed");
            }
        }
    }

    match ctx.backend.set_reparse_data(dentry_path, &buf) {
        Ok(()) => {}
        // Creating symlinks commonly requires a privilege; stay friendly
        // to unprivileged callers unless told otherwise.
        Err(e) if is_symlink && e.is_permission_denied() && !ctx.flags.strict_symlinks => {
            warn!("Can't set reparse data on \"{dentry_path}\": Access denied");
        }
        Err(e) => {
            error!("Failed to set reparse data on \"{dentry_path}\"");
            return Err(e);
        }
    }

    let size = ctx.streams.get(stream).size;
    ctx.progress.stream_completed(size);
    Ok(())
}

/// Extracts streams to one dentry's file.
///
/// With `only` unset, every stream of the dentry is written: the unnamed
/// stream (or reparse data / native symlink for reparse points) and any
/// supported named streams. With `only` set, just the matching slots are
/// written, reading the bytes from `relocated` when given; sequential
/// extraction uses this to realize one archive stream at a time,
/// possibly from a spill file.
pub(crate) fn extract_streams(
    ctx: &mut ApplyContext<'_, '_>,
    dentry_path: &str,
    id: DentryId,
    only: Option<StreamId>,
    relocated: Option<&StreamLocation>,
) -> Result<()> {
    if ctx.dentry_scratch(id).was_linked {
        return Ok(());
    }
    let inode = ctx.image.inode_of(id);
    let attrs = inode.attributes;

    if let Some(unnamed) = ctx.unnamed_stream(id) {
        if only.is_none() || only == Some(unnamed) {
            let relocated = if only.is_some() { relocated } else { None };
            if !(attrs.directory() || attrs.reparse_point()) {
                let size = ctx.streams.get(unnamed).size;
                let result = if attrs.encrypted() && ctx.caps.encrypted_files {
                    feed_stream(ctx, unnamed, relocated, |backend, feed| {
                        backend.extract_encrypted_stream(dentry_path, feed)
                    })
                } else {
                    feed_stream(ctx, unnamed, relocated, |backend, feed| {
                        backend.extract_unnamed_stream(dentry_path, feed)
                    })
                };
                result.inspect_err(|_| {
                    error!("Failed to extract data of \"{dentry_path}\"");
                })?;
                ctx.progress.stream_completed(size);
            } else if attrs.reparse_point() {
                if ctx.caps.reparse_points {
                    extract_reparse_data(ctx, dentry_path, id, unnamed, relocated)?;
                } else if inode.is_symlink() && ctx.caps.symlink_reparse_points {
                    extract_symlink(ctx, dentry_path, id, relocated)?;
                }
            }
        }
    }

    if ctx.can_extract_named_streams() {
        for (i, entry) in inode.ads.iter().enumerate() {
            if !entry.is_named() {
                continue;
            }
            let Some(stream) = ctx.ads_stream(id, i) else {
                continue;
            };
            if only.is_some_and(|o| o != stream) {
                continue;
            }
            let relocated = if only.is_some() { relocated } else { None };
            let size = ctx.streams.get(stream).size;
            feed_stream(ctx, stream, relocated, |backend, feed| {
                backend.extract_named_stream(dentry_path, &entry.name, Some(feed))
            })
            .inspect_err(|_| {
                error!("Failed to extract data of \"{dentry_path}\"");
            })?;
            ctx.progress.stream_completed(size);
        }
    }
    Ok(())
}

/// Extracts every dentry reference of one stream.
///
/// With a non-seekable source and more than one reference, the stream is
/// first spilled once into a temporary file and each reference reads
/// from there; the spill file is removed before returning.
pub(crate) fn extract_stream_instances(
    ctx: &mut ApplyContext<'_, '_>,
    stream: StreamId,
    can_seek: bool,
) -> Result<()> {
    let scratch = &ctx.stream_scratch[stream.index()];
    let refcnt = scratch.refcnt;
    let dentries: Vec<DentryId> = scratch.dentries.as_slice().to_vec();

    let mut spill: Option<tempfile::NamedTempFile> = None;
    let mut relocated: Option<StreamLocation> = None;
    if !can_seek && refcnt >= 2 {
        let mut file = tempfile::NamedTempFile::new().map_err(|source| Error::Open {
            path: std::env::temp_dir(),
            source,
        })?;

        let descriptor = ctx.streams.get(stream);
        let size = descriptor.size;
        let hash = descriptor.hash;
        let location = descriptor.location.clone();
        let reader = open_location(&mut *ctx.source, &location, size)?;
        let mut hashing = HashingReader::new(reader);
        std::io::copy(&mut hashing, file.as_file_mut()).map_err(|source| Error::Write {
            path: file.path().to_owned(),
            source,
        })?;
        if hashing.bytes_read() != size {
            return Err(Error::Read(std::io::ErrorKind::UnexpectedEof.into()));
        }
        if !hash.is_zero() {
            hashing.verify(&hash)?;
        }

        relocated = Some(StreamLocation::OnDisk(file.path().to_owned()));
        spill = Some(file);
    }

    // A dentry can reference this stream through several slots; the
    // per-dentry flag makes one extract_streams call cover them all.
    let result = (|| {
        for &dentry in &dentries {
            if ctx.dentry_scratch(dentry).tmp_flag {
                continue;
            }
            let Some(dentry_path) = path::build_extraction_path(ctx, dentry) else {
                continue;
            };
            extract_streams(ctx, &dentry_path, dentry, Some(stream), relocated.as_ref())?;
            ctx.dentry_scratch_mut(dentry).tmp_flag = true;
        }
        Ok(())
    })();
    for &dentry in &dentries {
        ctx.dentry_scratch_mut(dentry).tmp_flag = false;
    }
    drop(spill);
    result
}

/// Sequential strategy: realize the operation's streams in list order
/// (sorted to archive order beforehand).
pub(crate) fn extract_stream_list(ctx: &mut ApplyContext<'_, '_>) -> Result<()> {
    let can_seek = ctx.source.can_seek();
    for stream in ctx.stream_list.clone() {
        extract_stream_instances(ctx, stream, can_seek)?;
    }
    Ok(())
}

/// Pipe strategy: headers arrive in archive order; match each against
/// the needed digests, extract matches (spilling multi-reference
/// streams), let everything else flow past, and stop once every needed
/// stream was seen.
pub(crate) fn extract_streams_from_pipe(ctx: &mut ApplyContext<'_, '_>) -> Result<()> {
    while ctx.num_streams_remaining > 0 {
        let item = ctx.source.next_pipe_item()?;
        let (header, offset) = match item {
            PipeItem::HeaderResend => continue,
            PipeItem::Stream { header, offset } => (header, offset),
        };

        let needed = if header.is_metadata() {
            None
        } else {
            ctx.streams
                .lookup(&header.hash)
                .filter(|id| ctx.stream_scratch[id.index()].refcnt > 0)
        };

        match needed {
            Some(stream) => {
                if header.is_compressed() {
                    return Err(Error::Unsupported(
                        "compressed pipable WIM resources".into(),
                    ));
                }
                {
                    let descriptor = ctx.streams.get_mut(stream);
                    descriptor.size = header.uncompressed_size;
                    descriptor.location = StreamLocation::InWim {
                        offset,
                        stored_size: header.uncompressed_size,
                        compression: Compression::None,
                    };
                }
                extract_stream_instances(ctx, stream, false)?;
                ctx.num_streams_remaining -= 1;
            }
            None => {
                if header.is_compressed() {
                    return Err(Error::Unsupported(
                        "compressed pipable WIM resources".into(),
                    ));
                }
                ctx.source.skip_stream(header.uncompressed_size)?;
            }
        }
    }
    Ok(())
}

/// Writes the unnamed stream of a single regular file to `out`, for
/// extract-to-stdout. The applicator is bypassed entirely.
pub(crate) fn extract_dentry_to_writer(
    ctx: &mut ApplyContext<'_, '_>,
    id: DentryId,
    out: &mut dyn Write,
) -> Result<()> {
    let inode = ctx.image.inode_of(id);
    if inode.attributes.directory() || inode.attributes.reparse_point() {
        let full_path = ctx.image.full_path(id);
        error!(
            "\"{full_path}\" is not a regular file and therefore cannot be extracted \
             to standard output"
        );
        return Err(Error::NotARegularFile(full_path));
    }
    if let Some(stream) = ctx.unnamed_stream(id) {
        let descriptor = ctx.streams.get(stream);
        copy_stream_to_writer(
            ctx.source,
            &descriptor.location.clone(),
            descriptor.size,
            descriptor.hash,
            out,
        )?;
    }
    Ok(())
}

fn copy_stream_to_writer(
    source: &mut dyn WimSource,
    location: &StreamLocation,
    size: u64,
    hash: wim_dtyp::Sha1Hash,
    out: &mut dyn Write,
) -> Result<()> {
    let reader = open_location(source, location, size)?;
    let mut hashing = HashingReader::new(reader);
    std::io::copy(&mut hashing, out).map_err(Error::Read)?;
    if hashing.bytes_read() != size {
        return Err(Error::Read(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if !hash.is_zero() {
        hashing.verify(&hash)?;
    }
    Ok(())
}

/// Writes the contents (unnamed stream) of the file at `source_path`
/// inside `image` to `out`, returning the number of bytes written.
/// Directories and reparse points cannot be extracted this way.
pub fn extract_to_writer(
    image: &Image,
    streams: &StreamTable,
    source: &mut dyn WimSource,
    source_path: &str,
    out: &mut dyn Write,
) -> Result<u64> {
    let dentry = image
        .get_dentry(source_path)
        .ok_or_else(|| Error::PathDoesNotExist(source_path.to_string()))?;
    let inode = image.inode_of(dentry);
    if inode.attributes.directory() || inode.attributes.reparse_point() {
        return Err(Error::NotARegularFile(image.full_path(dentry)));
    }
    let stream = match inode.unnamed_stream {
        crate::streams::StreamRef::Empty => return Ok(0),
        crate::streams::StreamRef::Resolved(id) => id,
        crate::streams::StreamRef::ByHash(hash) => streams.lookup(&hash).ok_or_else(|| {
            Error::InvalidImage(format!(
                "stream {hash} is referenced by the image but missing from the archive"
            ))
        })?,
    };
    let descriptor = streams.get(stream);
    copy_stream_to_writer(
        source,
        &descriptor.location,
        descriptor.size,
        descriptor.hash,
        out,
    )?;
    Ok(descriptor.size)
}
