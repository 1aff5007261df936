//! File System Control Codes [MS-FSCC](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-fscc/efbfe127-73ad-4140-9967-ec6500e66d5e) for WIM images.
//!
//! WIM metadata stores each file's NT attribute bitmask and, for reparse
//! points, the tag and reparse buffer defined by MS-FSCC. This crate holds
//! those wire structures: the [`FileAttributes`] bitfield, [`ReparseTag`],
//! and the reparse-point buffer codec in [`reparse`].

use binrw::prelude::*;
use modular_bitfield::prelude::*;

pub mod error;
pub mod reparse;

pub use error::FsccError;
pub use reparse::{
    REPARSE_POINT_MAX_SIZE, ReparseData, ReparseTag, SYMBOLIC_LINK_FLAG_RELATIVE,
    absolute_path_prefix_len,
};

/// MS-FSCC 2.6
#[bitfield]
#[derive(BinWrite, BinRead, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[bw(map = |&x| Self::into_bytes(x))]
#[br(map = Self::from_bytes)]
pub struct FileAttributes {
    pub readonly: bool,
    pub hidden: bool,
    pub system: bool,
    #[skip]
    __: bool,

    pub directory: bool,
    pub archive: bool,
    #[skip]
    __: bool,
    pub normal: bool,

    pub temporary: bool,
    pub sparse_file: bool,
    pub reparse_point: bool,
    pub compressed: bool,

    pub offline: bool,
    pub not_content_indexed: bool,
    pub encrypted: bool,
    #[skip]
    __: B17,
}

impl FileAttributes {
    pub fn bits(&self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }
}

impl From<u32> for FileAttributes {
    fn from(value: u32) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }
}

impl From<FileAttributes> for u32 {
    fn from(value: FileAttributes) -> Self {
        value.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_attributes_bits() {
        assert_eq!(FileAttributes::new().with_readonly(true).bits(), 0x0001);
        assert_eq!(FileAttributes::new().with_directory(true).bits(), 0x0010);
        assert_eq!(FileAttributes::new().with_normal(true).bits(), 0x0080);
        assert_eq!(FileAttributes::new().with_reparse_point(true).bits(), 0x0400);
        assert_eq!(FileAttributes::new().with_encrypted(true).bits(), 0x4000);
    }

    #[test]
    fn test_file_attributes_round_trip() {
        let attrs = FileAttributes::from(0x0021u32);
        assert!(attrs.readonly());
        assert!(attrs.archive());
        assert!(!attrs.directory());
        assert_eq!(u32::from(attrs), 0x0021);
    }
}
