//! Reparse-point buffers.
//!
//! A reparse point carries a tag identifying its owner plus a
//! variable-length, tag-specific payload
//! ([MS-FSCC 2.1.2](<https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-fscc/c8e77b37-3909-4fe6-a4ea-2b9d423b1ee4>)).
//! Symbolic links and mount points (junctions) share a layout of
//! substitute-name and print-name ranges inside a path buffer; symbolic
//! links add a flags word. All other tags are opaque to this crate and are
//! carried through extraction bit-exact.

use std::fmt;
use std::io::Cursor;

use binrw::prelude::*;
use wim_dtyp::WideString;

use crate::FsccError;

/// Maximum size of a serialized reparse buffer, including the 8-byte
/// header (MS-FSCC 2.1.2.2).
pub const REPARSE_POINT_MAX_SIZE: usize = 16384;

/// Set in [`ReparseData::flags`] when a symbolic link target is relative
/// to its parent directory.
pub const SYMBOLIC_LINK_FLAG_RELATIVE: u32 = 0x0000_0001;

/// A reparse tag value.
///
/// Kept as a transparent `u32` rather than a closed enum: WIM images may
/// contain tags owned by arbitrary filter drivers, and those must survive
/// extraction unchanged.
#[derive(BinRead, BinWrite, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReparseTag(pub u32);

impl ReparseTag {
    /// MS-FSCC 2.1.2.4, symbolic link support.
    pub const SYMLINK: ReparseTag = ReparseTag(0xA000_000C);
    /// MS-FSCC 2.1.2.5, mount point (junction) support.
    pub const MOUNT_POINT: ReparseTag = ReparseTag(0xA000_0003);

    pub fn is_symlink(&self) -> bool {
        *self == Self::SYMLINK
    }

    pub fn is_mount_point(&self) -> bool {
        *self == Self::MOUNT_POINT
    }

    /// Whether the tag's payload uses the symlink/junction name layout.
    pub fn is_link(&self) -> bool {
        self.is_symlink() || self.is_mount_point()
    }
}

impl fmt::Debug for ReparseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReparseTag({:#010x})", self.0)
    }
}

impl fmt::Display for ReparseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[binrw::binrw]
#[brw(little)]
struct ReparseHeader {
    tag: ReparseTag,
    data_len: u16,
    reserved: u16,
}

#[binrw::binrw]
#[brw(little)]
struct LinkNameRanges {
    substitute_name_offset: u16,
    substitute_name_length: u16,
    print_name_offset: u16,
    print_name_length: u16,
}

/// Parsed symlink or mount-point reparse buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReparseData {
    pub tag: ReparseTag,
    /// The target path the filesystem actually follows, usually in NT
    /// namespace form (`\??\C:\...`).
    pub substitute_name: WideString,
    /// The user-visible form of the target.
    pub print_name: WideString,
    /// Symlink-only flags ([`SYMBOLIC_LINK_FLAG_RELATIVE`]); always zero
    /// for mount points.
    pub flags: u32,
}

impl ReparseData {
    /// Parses a full reparse buffer (header included).
    pub fn parse(buf: &[u8]) -> Result<Self, FsccError> {
        let mut cursor = Cursor::new(buf);
        let header =
            ReparseHeader::read(&mut cursor).map_err(|_| FsccError::ReparseBufferTooShort)?;
        if !header.tag.is_link() {
            return Err(FsccError::UnsupportedReparseTag(header.tag.0));
        }
        let data = buf
            .get(8..8 + header.data_len as usize)
            .ok_or(FsccError::ReparseBufferTooShort)?;

        let mut cursor = Cursor::new(data);
        let ranges =
            LinkNameRanges::read(&mut cursor).map_err(|_| FsccError::ReparseBufferTooShort)?;
        let flags = if header.tag.is_symlink() {
            u32::read_le(&mut cursor).map_err(|_| FsccError::ReparseBufferTooShort)?
        } else {
            0
        };
        let path_buffer = &data[cursor.position() as usize..];

        Ok(Self {
            tag: header.tag,
            substitute_name: slice_name(
                path_buffer,
                ranges.substitute_name_offset,
                ranges.substitute_name_length,
            )?,
            print_name: slice_name(
                path_buffer,
                ranges.print_name_offset,
                ranges.print_name_length,
            )?,
            flags,
        })
    }

    /// Serializes back into a full reparse buffer, substitute name first,
    /// bounded by [`REPARSE_POINT_MAX_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, FsccError> {
        let sub_bytes = self.substitute_name.size() as usize;
        let print_bytes = self.print_name.size() as usize;
        let ranges_len = 8 + if self.tag.is_symlink() { 4 } else { 0 };
        let data_len = ranges_len + sub_bytes + print_bytes;
        let total = 8 + data_len;
        if total > REPARSE_POINT_MAX_SIZE || data_len > u16::MAX as usize {
            return Err(FsccError::ReparseBufferTooLarge(total));
        }

        let mut cursor = Cursor::new(Vec::with_capacity(total));
        ReparseHeader {
            tag: self.tag,
            data_len: data_len as u16,
            reserved: 0,
        }
        .write(&mut cursor)?;
        LinkNameRanges {
            substitute_name_offset: 0,
            substitute_name_length: sub_bytes as u16,
            print_name_offset: sub_bytes as u16,
            print_name_length: print_bytes as u16,
        }
        .write(&mut cursor)?;
        if self.tag.is_symlink() {
            self.flags.write_le(&mut cursor)?;
        }
        self.substitute_name.write_le(&mut cursor)?;
        self.print_name.write_le(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Whether the target is relative to the link's parent directory.
    pub fn is_relative(&self) -> bool {
        self.tag.is_symlink() && self.flags & SYMBOLIC_LINK_FLAG_RELATIVE != 0
    }
}

fn slice_name(path_buffer: &[u8], offset: u16, length: u16) -> Result<WideString, FsccError> {
    let (offset, length) = (offset as usize, length as usize);
    if length % 2 != 0 {
        return Err(FsccError::InvalidNameBounds);
    }
    let bytes = path_buffer
        .get(offset..offset + length)
        .ok_or(FsccError::InvalidNameBounds)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Classifies a substitute name, returning the number of UTF-16 units
/// occupied by its absolute-path prefix:
///
/// - `\??\X:\path` yields 6 (the `\??\X:` portion),
/// - `X:\path` yields 2 (the `X:` portion),
/// - volume-GUID junction targets and relative targets yield `None`,
///   meaning the name must be left alone.
pub fn absolute_path_prefix_len(units: &[u16], tag: ReparseTag) -> Option<usize> {
    const VOLUME_PREFIX: &str = "\\\\?\\Volume{";

    let unit = |i: usize| units.get(i).copied().unwrap_or(0);
    if units.len() >= 7
        && units[..4] == [b'\\' as u16, b'?' as u16, b'?' as u16, b'\\' as u16]
        && unit(4) != 0
        && unit(5) == b':' as u16
        && unit(6) == b'\\' as u16
    {
        return Some(6);
    }
    if tag.is_symlink()
        && units.len() >= VOLUME_PREFIX.len()
        && VOLUME_PREFIX
            .encode_utf16()
            .eq(units[..VOLUME_PREFIX.len()].iter().copied())
    {
        return None;
    }
    if units.len() >= 3 && unit(0) != 0 && unit(1) == b':' as u16 && unit(2) == b'\\' as u16 {
        return Some(2);
    }
    None
}
