use std::io;
use std::path::PathBuf;

use thiserror::Error;
use wim_dtyp::Sha1Hash;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("Path \"{0}\" does not exist in the image")]
    PathDoesNotExist(String),
    #[error("Out of memory")]
    NoMem,
    #[error("Failed to open \"{path}\": {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("Failed to stat \"{path}\": {source}")]
    Stat { path: PathBuf, source: io::Error },
    #[error("Read error: {0}")]
    Read(#[source] io::Error),
    #[error("Failed to write \"{path}\": {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("Failed to read symlink target of \"{path}\": {source}")]
    ReadLink { path: PathBuf, source: io::Error },
    #[error("Failed to create directory \"{path}\": {source}")]
    MkDir { path: PathBuf, source: io::Error },
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Reparse point fixup of \"{0}\" failed")]
    ReparseFixupFailed(String),
    #[error("\"{0}\" is not a regular file")]
    NotARegularFile(String),
    #[error("The input is not a pipable WIM")]
    NotPipable,
    #[error("Invalid pipable WIM: {0}")]
    InvalidPipableWim(&'static str),
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Inconsistent WIM XML data: {0}")]
    XmlInconsistent(String),
    #[error("The WIM is read-only")]
    WimIsReadOnly,
    #[error("Stream {hash} has wrong SHA-1 message digest (got {actual})")]
    StreamHashMismatch { hash: Sha1Hash, actual: Sha1Hash },
    #[error("Invalid reparse data: {0}")]
    InvalidReparseData(#[from] wim_fscc::FsccError),
    #[error("Binrw Error: {0}")]
    BinRWError(#[from] binrw::Error),
}

impl Error {
    /// Whether the underlying cause is a permission failure. Some
    /// finalization steps deliberately stay quiet about those in
    /// non-strict mode.
    pub fn is_permission_denied(&self) -> bool {
        let source = match self {
            Error::Open { source, .. }
            | Error::Stat { source, .. }
            | Error::Write { source, .. }
            | Error::ReadLink { source, .. }
            | Error::MkDir { source, .. } => source,
            Error::Read(source) => source,
            _ => return false,
        };
        source.kind() == io::ErrorKind::PermissionDenied
    }
}
