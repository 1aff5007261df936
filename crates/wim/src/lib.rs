//! An engine for applying Windows Imaging (WIM) images.
//!
//! A WIM archive is content-addressed: every data stream is stored once,
//! identified by the SHA-1 of its contents, and referenced from any number
//! of directory entries across any number of images. This crate takes a
//! resolved image tree ([`Image`]), the archive's stream table
//! ([`StreamTable`]), a byte source ([`source::WimSource`]), and an
//! [`Applicator`] modeling the target volume, and materializes the image:
//!
//! * [`apply::extract_image`] applies one image (or all of them) to a
//!   directory or volume;
//! * [`apply::extract_files`] extracts selected subtrees;
//! * [`pipe::extract_image_from_pipe`] applies an image from a pipable WIM
//!   arriving over a non-seekable stream, matching data by SHA-1 as it
//!   flows past.
//!
//! Parsing of the WIM container's metadata resources (the dentry-tree
//! codec) and block decompression are intentionally out of scope; they are
//! supplied by the caller.

pub mod apply;
pub mod backend;
pub mod error;
pub mod image;
pub mod pipe;
pub mod progress;
pub mod security;
pub mod source;
pub mod streams;
pub mod xml;

pub use apply::{
    ExtractCommand, ExtractFlags, ImageSelect, extract_files, extract_image, extract_to_writer,
};
pub use backend::{Applicator, BackendOptions, StreamFeed, UnixData, VolumeCapabilities};
pub use error::Error;
pub use image::{AdsEntry, Dentry, DentryId, Image, Inode, InodeId};
pub use pipe::extract_image_from_pipe;
pub use progress::{ProgressInfo, ProgressMsg};
pub use security::SecurityData;
pub use streams::{
    Compression, StreamDescriptor, StreamId, StreamLocation, StreamRef, StreamTable,
};
pub use wim_dtyp::{FileTime, Sha1Hash, WideString};
pub use wim_fscc::{FileAttributes, ReparseTag};
pub use xml::WimInfo;

pub type Result<T> = std::result::Result<T, Error>;

/// Header flag set on archives whose reparse-point targets were rewritten
/// to be root-relative at capture time; enables target fixup by default on
/// apply.
pub const WIM_HDR_FLAG_RP_FIX: u32 = 0x0000_0080;

/// A WIM archive resolved into memory: images, stream table, and the XML
/// info block. The container parser produces one of these; the extraction
/// entry points consume it.
#[derive(Debug, Default)]
pub struct WimArchive {
    pub images: Vec<Image>,
    pub streams: StreamTable,
    pub info: WimInfo,
    /// `WIM_HDR_FLAG_*` bits from the archive header.
    pub header_flags: u32,
}

impl WimArchive {
    /// The number of images, per the image trees actually loaded.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}
