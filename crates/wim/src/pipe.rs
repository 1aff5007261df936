//! Pipable WIM support.
//!
//! A pipable WIM interleaves stream data with the metadata so the whole
//! archive can be applied from a non-seekable stream: file header, XML
//! data, per-image metadata resources, then file streams, each introduced
//! by a small header carrying its SHA-1 and size. The engine matches
//! arriving streams against the digests it needs and lets the rest flow
//! past.

use std::io::{Cursor, Read};

use binrw::prelude::*;
use wim_dtyp::Sha1Hash;

use crate::apply::{self, ExtractFlags, ImageSelect};
use crate::backend::Applicator;
use crate::image::Image;
use crate::progress::ProgressFn;
use crate::source::WimSource;
use crate::streams::{Compression, StreamLocation, StreamTable};
use crate::xml::WimInfo;
use crate::{Error, Result};

/// Magic at offset 0 of a pipable WIM ("WLPWM\0\0\0").
pub const PWM_MAGIC: u64 = u64::from_le_bytes(*b"WLPWM\0\0\0");
/// Magic introducing each stream inside a pipable WIM.
pub const PWM_STREAM_MAGIC: u64 = 0x2b9b_9ba2_443d_b9d8;

pub const WIM_HEADER_DISK_SIZE: usize = 208;
const PWM_STREAM_HEADER_SIZE: usize = 40;

pub const RESHDR_FLAG_METADATA: u32 = 0x02;
pub const RESHDR_FLAG_COMPRESSED: u32 = 0x04;

/// On-disk resource header: 7 bytes of stored size, 1 byte of flags,
/// then offset and uncompressed size.
#[binrw::binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceHeaderDisk {
    size_and_flags: u64,
    pub offset: u64,
    pub original_size: u64,
}

impl ResourceHeaderDisk {
    pub fn stored_size(&self) -> u64 {
        self.size_and_flags & 0x00ff_ffff_ffff_ffff
    }

    pub fn flags(&self) -> u8 {
        (self.size_and_flags >> 56) as u8
    }
}

/// The fixed-size WIM file header.
#[binrw::binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct WimHeaderDisk {
    pub magic: u64,
    pub header_size: u32,
    pub version: u32,
    /// `WIM_HDR_FLAG_*` bits.
    pub flags: u32,
    pub chunk_size: u32,
    pub guid: [u8; 16],
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub lookup_table: ResourceHeaderDisk,
    pub xml_data: ResourceHeaderDisk,
    pub boot_metadata: ResourceHeaderDisk,
    pub boot_index: u32,
    pub integrity: ResourceHeaderDisk,
    pub unused: [u8; 60],
}

/// Header preceding each stream in a pipable WIM.
#[binrw::binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy)]
pub struct PwmStreamHeader {
    pub magic: u64,
    pub uncompressed_size: u64,
    pub hash: Sha1Hash,
    pub flags: u32,
}

impl PwmStreamHeader {
    pub fn is_metadata(&self) -> bool {
        self.flags & RESHDR_FLAG_METADATA != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & RESHDR_FLAG_COMPRESSED != 0
    }
}

/// One element read off a pipable WIM.
#[derive(Debug)]
pub enum PipeItem {
    /// The WIM file header, re-sent before each part's data.
    HeaderResend,
    /// A stream header; the body begins at `offset`.
    Stream { header: PwmStreamHeader, offset: u64 },
}

/// A [`WimSource`] over a non-seekable byte stream positioned at the
/// start of a pipable WIM's element sequence.
pub struct PipeSource<R: Read> {
    inner: R,
    offset: u64,
}

impl<R: Read> PipeSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Current byte offset within the piped archive.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).map_err(Error::Read)?;
        self.offset += len as u64;
        Ok(buf)
    }

    /// Reads and validates the WIM file header at the current position.
    pub fn read_wim_header(&mut self) -> Result<WimHeaderDisk> {
        let bytes = self.read_exact_vec(WIM_HEADER_DISK_SIZE)?;
        let header = WimHeaderDisk::read(&mut Cursor::new(&bytes))?;
        if header.magic != PWM_MAGIC {
            return Err(Error::NotPipable);
        }
        Ok(header)
    }
}

struct PipeBody<'a, R: Read> {
    source: &'a mut PipeSource<R>,
    remaining: u64,
}

impl<R: Read> Read for PipeBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let want = buf.len().min(self.remaining as usize);
        if want == 0 {
            return Ok(0);
        }
        let n = self.source.inner.read(&mut buf[..want])?;
        self.source.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl<R: Read> WimSource for PipeSource<R> {
    fn can_seek(&self) -> bool {
        false
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
                if *offset != self.offset {
                    return Err(Error::InvalidParam(
                        "a pipe source can only read the stream at its current position",
                    ));
                }
                Ok(Box::new(PipeBody {
                    source: self,
                    remaining: size,
                }))
            }
            StreamLocation::InWim { .. } => Err(Error::Unsupported(
                "compressed resources require a decompressing source".into(),
            )),
            _ => Err(Error::InvalidParam(
                "only in-archive locations are served by a WIM source",
            )),
        }
    }

    fn next_pipe_item(&mut self) -> Result<PipeItem> {
        let bytes = self.read_exact_vec(PWM_STREAM_HEADER_SIZE)?;
        let mut magic_bytes = [0u8; 8];
        magic_bytes.copy_from_slice(&bytes[..8]);
        let magic = u64::from_le_bytes(magic_bytes);
        if magic == PWM_MAGIC {
            // The full file header is re-sent; consume the rest of it.
            self.read_exact_vec(WIM_HEADER_DISK_SIZE - PWM_STREAM_HEADER_SIZE)?;
            return Ok(PipeItem::HeaderResend);
        }
        let header = PwmStreamHeader::read(&mut Cursor::new(&bytes))?;
        if header.magic != PWM_STREAM_MAGIC {
            return Err(Error::InvalidPipableWim(
                "expected a stream header on the pipe",
            ));
        }
        Ok(PipeItem::Stream {
            header,
            offset: self.offset,
        })
    }

    fn skip_stream(&mut self, size: u64) -> Result<()> {
        let copied = std::io::copy(
            &mut (&mut self.inner).take(size),
            &mut std::io::sink(),
        )
        .map_err(Error::Read)?;
        self.offset += copied;
        if copied != size {
            return Err(Error::Read(std::io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }
}

/// Applies one image of a pipable WIM arriving over `reader`.
///
/// The WIM's dentry-tree codec is not part of this crate;
/// `parse_metadata` receives the selected image's raw metadata resource
/// and returns the resolved [`Image`].
pub fn extract_image_from_pipe<'p, R: Read>(
    reader: R,
    image: ImageSelect,
    target: &str,
    mut flags: ExtractFlags,
    backend: &mut dyn Applicator,
    parse_metadata: &mut dyn FnMut(&[u8]) -> Result<Image>,
    progress: Option<&'p mut ProgressFn<'p>>,
) -> Result<()> {
    if flags.to_stdout {
        return Err(Error::InvalidParam(
            "cannot extract to standard output from a pipe",
        ));
    }
    flags.sequential = true;
    flags.from_pipe = true;

    let mut source = PipeSource::new(reader);
    let header = source.read_wim_header()?;
    if header.part_number != 1 {
        return Err(Error::InvalidPipableWim(
            "the first part of a split WIM must be sent over the pipe first",
        ));
    }

    // The XML data directly follows the header in pipable WIMs.
    let info = match source.next_pipe_item()? {
        PipeItem::Stream { header, .. } if header.is_metadata() => {
            if header.is_compressed() {
                return Err(Error::Unsupported(
                    "compressed pipable WIM resources".into(),
                ));
            }
            WimInfo::parse(&source.read_exact_vec(header.uncompressed_size as usize)?)?
        }
        _ => {
            return Err(Error::InvalidPipableWim(
                "expected XML data, but found a non-metadata stream",
            ));
        }
    };
    if info.image_count() != header.image_count as usize {
        return Err(Error::XmlInconsistent(
            "image count in XML data disagrees with the WIM header".into(),
        ));
    }

    let selected = match image {
        ImageSelect::All => {
            return Err(Error::InvalidImage(
                "applying all images from a pipe is not supported".into(),
            ));
        }
        ImageSelect::Index(n) if (1..=info.image_count()).contains(&n) => n,
        ImageSelect::Index(n) => {
            return Err(Error::InvalidImage(format!(
                "image {n} does not exist in the pipable WIM"
            )));
        }
        ImageSelect::Name(ref name) => match info.resolve_image(name) {
            Some(ImageSelect::Index(n)) => n,
            _ => {
                return Err(Error::InvalidImage(format!(
                    "\"{name}\" is not a valid image in the pipable WIM"
                )));
            }
        },
    };

    // Metadata resources come next, one per image and in image order;
    // keep the selected one and let the rest flow past.
    let mut selected_image = None;
    for i in 1..=header.image_count as usize {
        match source.next_pipe_item()? {
            PipeItem::Stream { header, .. } if header.is_metadata() => {
                if header.is_compressed() {
                    return Err(Error::Unsupported(
                        "compressed pipable WIM resources".into(),
                    ));
                }
                if i == selected {
                    let bytes = source.read_exact_vec(header.uncompressed_size as usize)?;
                    selected_image = Some(parse_metadata(&bytes)?);
                } else {
                    source.skip_stream(header.uncompressed_size)?;
                }
            }
            _ => {
                return Err(Error::InvalidPipableWim(
                    "expected a metadata resource, but found a non-metadata stream",
                ));
            }
        }
    }
    let image = selected_image.ok_or(Error::InvalidPipableWim(
        "metadata resource for the selected image is missing",
    ))?;

    // The stream table starts empty; descriptors are synthesized from
    // the image's digests and located as headers arrive.
    let mut streams = StreamTable::default();
    apply::extract_single_image(
        &image,
        &mut streams,
        &info,
        selected,
        &mut source,
        backend,
        target,
        flags,
        header.flags,
        progress,
    )
}
