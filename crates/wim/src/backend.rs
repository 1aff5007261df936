//! The applicator seam: everything the extraction engine needs from a
//! materialization target, expressed as one trait plus plain capability
//! and path-vocabulary structs.
//!
//! The engine is written entirely against `&mut dyn Applicator`; POSIX
//! directories, Win32 volumes, and NTFS-3g volumes are ordinary
//! implementations. Capabilities are data, not subtypes: a backend
//! reports what the actual volume supports from [`Applicator::start`],
//! and the engine degrades or fails per its flags.

use std::io::{self, Read};

use wim_dtyp::{FileTime, WideString};
use wim_fscc::FileAttributes;

use crate::{Error, Result};

#[cfg(unix)]
pub mod posix;

/// UNIX ownership and permissions captured in a WIM image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixData {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// What the target volume can represent. Everything defaults to
/// unsupported; backends opt in from [`Applicator::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeCapabilities {
    pub archive_files: bool,
    pub hidden_files: bool,
    pub system_files: bool,
    pub compressed_files: bool,
    pub encrypted_files: bool,
    pub not_content_indexed_files: bool,
    pub sparse_files: bool,
    pub named_data_streams: bool,
    pub hard_links: bool,
    pub reparse_points: bool,
    pub symlink_reparse_points: bool,
    pub security_descriptors: bool,
    pub short_names: bool,
    pub unix_data: bool,
    pub file_attributes: bool,
    pub timestamps: bool,
    pub case_sensitive_filenames: bool,
}

/// The backend's path vocabulary and path-related policies.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Name used in messages ("POSIX", "Win32", "NTFS-3g", ...).
    pub name: &'static str,
    /// Prefix prepended to every constructed path (e.g. `\\?\` on
    /// Win32).
    pub path_prefix: String,
    pub path_separator: char,
    /// Maximum accepted path length, in characters.
    pub path_max: usize,
    /// Construct paths under the extraction target.
    pub requires_target_in_paths: bool,
    /// Construct paths under the resolved absolute form of the target.
    pub requires_realtarget_in_paths: bool,
    /// The volume root needs special treatment: it is never created and
    /// its attributes are never set.
    pub root_directory_is_special: bool,
    /// Whether the target path can be resolved to an absolute path
    /// before it exists.
    pub realpath_works_on_nonexisting_files: bool,
    /// Characters that cannot appear in a filename on this target.
    pub forbidden_name_chars: Vec<char>,
    /// Whether names may not end with a space or period.
    pub forbid_trailing_space_dot: bool,
    /// Replacement used when invalid-name replacement is requested.
    pub name_replacement_char: char,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            name: "generic",
            path_prefix: String::new(),
            path_separator: '/',
            path_max: 4096,
            requires_target_in_paths: true,
            requires_realtarget_in_paths: false,
            root_directory_is_special: false,
            realpath_works_on_nonexisting_files: false,
            forbidden_name_chars: vec!['/', '\0'],
            forbid_trailing_space_dot: false,
            name_replacement_char: '?',
        }
    }
}

impl BackendOptions {
    /// The Win32 vocabulary: `\`-separated, NT-forbidden characters, no
    /// trailing space or period, U+FFFD replacement.
    pub fn win32() -> Self {
        Self {
            name: "Win32",
            path_separator: '\\',
            path_max: 32767,
            requires_realtarget_in_paths: true,
            realpath_works_on_nonexisting_files: false,
            forbidden_name_chars: vec![
                '\\', '/', ':', '*', '?', '"', '<', '>', '|', '\0',
            ],
            forbid_trailing_space_dot: true,
            name_replacement_char: '\u{fffd}',
            ..Self::default()
        }
    }
}

/// A sized stream of uncompressed bytes handed to an applicator.
pub struct StreamFeed<'a> {
    reader: &'a mut dyn Read,
    size: u64,
}

impl<'a> StreamFeed<'a> {
    pub(crate) fn new(reader: &'a mut dyn Read, size: u64) -> Self {
        Self { reader, size }
    }

    /// Uncompressed size of the stream; exactly this many bytes can be
    /// read.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for StreamFeed<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

fn unsupported(what: &str, name: &str) -> Error {
    Error::Unsupported(format!("{what} is not supported by the {name} applicator"))
}

/// Operations the engine drives against a materialization target.
///
/// Paths are in the vocabulary described by [`Applicator::options`]. The
/// engine only invokes an operation when the reported capabilities claim
/// support, so the optional operations default to an `Unsupported` error.
pub trait Applicator {
    fn options(&self) -> &BackendOptions;

    /// Capabilities of the volume behind the current target. Valid after
    /// [`start`](Self::start).
    fn capabilities(&self) -> &VolumeCapabilities;

    /// Prepare to extract to `target`, probing the volume's capabilities.
    fn start(&mut self, target: &str) -> Result<()>;

    /// Whether `target` is the root of the volume itself.
    fn target_is_root(&self, _target: &str) -> bool {
        false
    }

    fn create_directory(&mut self, path: &str) -> Result<()>;

    fn create_file(&mut self, path: &str) -> Result<()>;

    fn create_hard_link(&mut self, old_path: &str, new_path: &str) -> Result<()>;

    fn create_symlink(&mut self, target: &str, link_path: &str) -> Result<()>;

    fn extract_unnamed_stream(&mut self, path: &str, stream: &mut StreamFeed<'_>) -> Result<()>;

    /// Writes a named data stream. `stream` is `None` when only the
    /// empty named-stream slot must exist.
    fn extract_named_stream(
        &mut self,
        _path: &str,
        _name: &WideString,
        _stream: Option<&mut StreamFeed<'_>>,
    ) -> Result<()> {
        Err(unsupported("named data streams", self.options().name))
    }

    fn extract_encrypted_stream(
        &mut self,
        _path: &str,
        _stream: &mut StreamFeed<'_>,
    ) -> Result<()> {
        Err(unsupported("encrypted streams", self.options().name))
    }

    fn set_reparse_data(&mut self, _path: &str, _reparse_buffer: &[u8]) -> Result<()> {
        Err(unsupported("reparse points", self.options().name))
    }

    fn set_file_attributes(&mut self, _path: &str, _attributes: FileAttributes) -> Result<()> {
        Err(unsupported("file attributes", self.options().name))
    }

    fn set_short_name(&mut self, _path: &str, _short_name: &WideString) -> Result<()> {
        Err(unsupported("short names", self.options().name))
    }

    fn set_security_descriptor(
        &mut self,
        _path: &str,
        _descriptor: &[u8],
        _strict: bool,
    ) -> Result<()> {
        Err(unsupported("security descriptors", self.options().name))
    }

    fn set_unix_data(&mut self, _path: &str, _data: &UnixData) -> Result<()> {
        Err(unsupported("UNIX data", self.options().name))
    }

    fn set_timestamps(
        &mut self,
        _path: &str,
        _creation: FileTime,
        _last_write: FileTime,
        _last_access: FileTime,
    ) -> Result<()> {
        Err(unsupported("timestamps", self.options().name))
    }

    /// The operation failed; release anything held since
    /// [`start`](Self::start).
    fn abort(&mut self) {}

    /// The operation succeeded; flush and release.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}
