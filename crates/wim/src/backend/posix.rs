//! The POSIX applicator: extracts onto an ordinary UNIX filesystem.
//!
//! Windows-only metadata (attributes, ADS, short names, security
//! descriptors) is not representable here; the engine degrades those per
//! its flags. Symbolic links are created natively from decoded reparse
//! targets, and UNIX ownership/permissions captured in the image can be
//! restored.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs as unix_fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::SystemTime;

use filetime::{FileTime as UnixFileTime, set_file_times, set_symlink_file_times};
use wim_dtyp::FileTime;

use crate::backend::{Applicator, BackendOptions, StreamFeed, UnixData, VolumeCapabilities};
use crate::{Error, Result};

pub struct PosixApplicator {
    options: BackendOptions,
    capabilities: VolumeCapabilities,
}

impl PosixApplicator {
    pub fn new() -> Self {
        Self {
            options: BackendOptions {
                name: "POSIX",
                ..BackendOptions::default()
            },
            capabilities: VolumeCapabilities {
                hard_links: true,
                symlink_reparse_points: true,
                unix_data: true,
                timestamps: true,
                case_sensitive_filenames: true,
                ..VolumeCapabilities::default()
            },
        }
    }
}

impl Default for PosixApplicator {
    fn default() -> Self {
        Self::new()
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

impl Applicator for PosixApplicator {
    fn options(&self) -> &BackendOptions {
        &self.options
    }

    fn capabilities(&self) -> &VolumeCapabilities {
        &self.capabilities
    }

    fn start(&mut self, target: &str) -> Result<()> {
        // The target directory itself is created on demand; only its
        // parent must already exist.
        let path = Path::new(target);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::metadata(parent).map_err(|source| Error::Stat {
                    path: parent.to_owned(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    fn create_directory(&mut self, path: &str) -> Result<()> {
        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            // Re-extraction over an existing tree is allowed.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && Path::new(path).is_dir() => {
                Ok(())
            }
            Err(source) => Err(Error::MkDir {
                path: path.into(),
                source,
            }),
        }
    }

    fn create_file(&mut self, path: &str) -> Result<()> {
        File::create(path)
            .map(drop)
            .map_err(|source| Error::Open {
                path: path.into(),
                source,
            })
    }

    fn create_hard_link(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        if fs::symlink_metadata(new_path).is_ok() {
            fs::remove_file(new_path).map_err(|source| Error::Write {
                path: new_path.into(),
                source,
            })?;
        }
        fs::hard_link(old_path, new_path).map_err(|source| Error::Write {
            path: new_path.into(),
            source,
        })
    }

    fn create_symlink(&mut self, target: &str, link_path: &str) -> Result<()> {
        if fs::symlink_metadata(link_path).is_ok() {
            fs::remove_file(link_path).map_err(|source| Error::Write {
                path: link_path.into(),
                source,
            })?;
        }
        unix_fs::symlink(target, link_path).map_err(|source| Error::Write {
            path: link_path.into(),
            source,
        })
    }

    fn extract_unnamed_stream(&mut self, path: &str, stream: &mut StreamFeed<'_>) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.into(),
                source,
            })?;
        io::copy(stream, &mut file).map_err(|source| Error::Write {
            path: path.into(),
            source,
        })?;
        Ok(())
    }

    fn set_unix_data(&mut self, path: &str, data: &UnixData) -> Result<()> {
        let wrap = |source| Error::Write {
            path: path.into(),
            source,
        };
        unix_fs::lchown(path, Some(data.uid), Some(data.gid)).map_err(wrap)?;
        if !is_symlink(Path::new(path)) {
            fs::set_permissions(path, fs::Permissions::from_mode(data.mode)).map_err(wrap)?;
        }
        Ok(())
    }

    fn set_timestamps(
        &mut self,
        path: &str,
        _creation: FileTime,
        last_write: FileTime,
        last_access: FileTime,
    ) -> Result<()> {
        // Creation time is not settable through POSIX interfaces.
        let mtime = UnixFileTime::from_system_time(SystemTime::from(last_write));
        let atime = UnixFileTime::from_system_time(SystemTime::from(last_access));
        let result = if is_symlink(Path::new(path)) {
            set_symlink_file_times(path, atime, mtime)
        } else {
            set_file_times(path, atime, mtime)
        };
        result.map_err(|source| Error::Write {
            path: path.into(),
            source,
        })
    }
}
