//! Feature negotiation: what the tree needs versus what the volume can
//! represent.
//!
//! The default policy degrades gracefully, warning once per feature with
//! the number of affected files; the strictness flags and the link-mode
//! flags turn specific gaps into hard errors.

use log::warn;

use crate::apply::ExtractFlags;
use crate::backend::VolumeCapabilities;
use crate::image::{DentryId, Image};
use crate::{Error, Result};

/// Counts of dentries/inodes needing each feature.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FeatureTally {
    pub archive_files: u64,
    pub hidden_files: u64,
    pub system_files: u64,
    pub compressed_files: u64,
    pub encrypted_files: u64,
    pub not_content_indexed_files: u64,
    pub sparse_files: u64,
    pub named_data_streams: u64,
    pub hard_links: u64,
    pub reparse_points: u64,
    pub symlink_reparse_points: u64,
    pub other_reparse_points: u64,
    pub security_descriptors: u64,
    pub short_names: u64,
    pub unix_data: u64,
}

/// Walks the subtree once, counting features. Inodes are counted once;
/// further dentries of the same inode count as hard links.
pub(crate) fn tally(image: &Image, root: DentryId) -> FeatureTally {
    let mut tally = FeatureTally::default();
    let mut visited = vec![false; image.inode_count()];
    // Infallible walk.
    let _ = image.walk_pre(root, &mut |image, id| {
        let dentry = image.dentry(id);
        let inode = image.inode(dentry.inode);
        let attrs = &inode.attributes;

        if attrs.archive() {
            tally.archive_files += 1;
        }
        if attrs.hidden() {
            tally.hidden_files += 1;
        }
        if attrs.system() {
            tally.system_files += 1;
        }
        if attrs.compressed() {
            tally.compressed_files += 1;
        }
        if attrs.encrypted() {
            tally.encrypted_files += 1;
        }
        if attrs.not_content_indexed() {
            tally.not_content_indexed_files += 1;
        }
        if attrs.sparse_file() {
            tally.sparse_files += 1;
        }
        if inode.has_named_stream() {
            tally.named_data_streams += 1;
        }
        if visited[dentry.inode.index()] {
            tally.hard_links += 1;
        }
        if attrs.reparse_point() {
            tally.reparse_points += 1;
            if inode.is_symlink() {
                tally.symlink_reparse_points += 1;
            } else {
                tally.other_reparse_points += 1;
            }
        }
        if inode.security_id != -1 {
            tally.security_descriptors += 1;
        }
        if !dentry.short_name.is_empty() {
            tally.short_names += 1;
        }
        if inode.unix_data.is_some() {
            tally.unix_data += 1;
        }
        visited[dentry.inode.index()] = true;
        Ok(())
    });
    tally
}

fn warn_attr(count: u64, what: &str) {
    if count != 0 {
        warn!(
            "{count} files are marked as {what}, but this attribute is not supported \
             in this extraction mode or volume."
        );
    }
}

/// Compares the tally against the volume's capabilities, warning about
/// degradations and failing on the combinations the flags make fatal.
pub(crate) fn check(
    required: &FeatureTally,
    caps: &VolumeCapabilities,
    flags: ExtractFlags,
    backend_name: &str,
) -> Result<()> {
    if !caps.archive_files {
        warn_attr(required.archive_files, "archived");
    }
    if !caps.hidden_files {
        warn_attr(required.hidden_files, "hidden");
    }
    if !caps.system_files {
        warn_attr(required.system_files, "system files");
    }
    if required.compressed_files != 0 && !caps.compressed_files {
        warn!(
            "{} files are marked as being transparently compressed, but transparent \
             compression is not supported in this extraction mode or volume. \
             These files will be extracted as uncompressed.",
            required.compressed_files
        );
    }
    if required.encrypted_files != 0 && !caps.encrypted_files {
        warn!(
            "{} files are marked as being encrypted, but encryption is not supported \
             in this extraction mode or volume. These files will be extracted as raw \
             encrypted data instead.",
            required.encrypted_files
        );
    }
    if !caps.not_content_indexed_files {
        warn_attr(required.not_content_indexed_files, "not content indexed");
    }
    if !caps.sparse_files {
        warn_attr(required.sparse_files, "sparse");
    }
    if required.named_data_streams != 0 && !caps.named_data_streams {
        warn!(
            "{} files contain one or more alternate (named) data streams, which are \
             not supported in this extraction mode or volume. \
             Alternate data streams will NOT be extracted.",
            required.named_data_streams
        );
    }
    if flags.is_linked() && required.named_data_streams != 0 && caps.named_data_streams {
        warn!(
            "{} files contain one or more alternate (named) data streams, which are \
             not supported in linked extraction mode. \
             Alternate data streams will NOT be extracted.",
            required.named_data_streams
        );
    }
    if required.hard_links != 0 && !caps.hard_links {
        warn!(
            "{} files are hard links, but hard links are not supported in this \
             extraction mode or volume. Hard links will be extracted as duplicate \
             copies of the linked files.",
            required.hard_links
        );
    }
    if required.reparse_points != 0 && !caps.reparse_points {
        if caps.symlink_reparse_points {
            if required.other_reparse_points != 0 {
                warn!(
                    "{} files are reparse points that are neither symbolic links nor \
                     junction points and are not supported in this extraction mode or \
                     volume. These reparse points will not be extracted.",
                    required.other_reparse_points
                );
            }
        } else {
            warn!(
                "{} files are reparse points, which are not supported in this \
                 extraction mode or volume and will not be extracted.",
                required.reparse_points
            );
        }
    }
    if required.security_descriptors != 0 && !caps.security_descriptors {
        warn!(
            "{} files have Windows NT security descriptors, but extracting security \
             descriptors is not supported in this extraction mode or volume. \
             No security descriptors will be extracted.",
            required.security_descriptors
        );
    }
    if required.short_names != 0 && !caps.short_names {
        warn!(
            "{} files have short (DOS) names, but extracting short names is not \
             supported in this extraction mode or volume. \
             Short names will not be extracted.",
            required.short_names
        );
    }

    if flags.unix_data && required.unix_data != 0 && !caps.unix_data {
        return Err(Error::Unsupported(format!(
            "UNIX data is not supported in the {backend_name} extraction mode or volume"
        )));
    }
    if flags.strict_short_names && required.short_names != 0 && !caps.short_names {
        return Err(Error::Unsupported(format!(
            "short names are not supported in the {backend_name} extraction mode or volume"
        )));
    }
    if flags.strict_timestamps && !caps.timestamps {
        return Err(Error::Unsupported(format!(
            "timestamps are not supported in the {backend_name} extraction mode or volume"
        )));
    }
    if flags.strict_acls
        && !flags.unix_data
        && required.security_descriptors != 0
        && !caps.security_descriptors
    {
        return Err(Error::Unsupported(format!(
            "security descriptors are not supported in the {backend_name} extraction \
             mode or volume"
        )));
    }
    if flags.hardlink && !caps.hard_links {
        return Err(Error::Unsupported(
            "hard link extraction mode was requested, but the extraction mode or \
             volume does not support hard links"
                .into(),
        ));
    }
    if flags.symlink && !caps.symlink_reparse_points {
        return Err(Error::Unsupported(
            "symbolic link extraction mode was requested, but the extraction mode or \
             volume does not support symbolic links"
                .into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Inode;
    use crate::streams::StreamRef;
    use wim_dtyp::Sha1Hash;
    use wim_fscc::{FileAttributes, ReparseTag};

    fn image_with_links_and_symlink() -> Image {
        let mut image = Image::new(Inode {
            attributes: FileAttributes::new().with_directory(true),
            ..Default::default()
        });
        let file = image.add_inode(Inode {
            unnamed_stream: StreamRef::ByHash(Sha1Hash::of(b"data")),
            security_id: 0,
            ..Default::default()
        });
        image.add_child(image.root(), "a", file);
        image.add_child(image.root(), "b", file);
        let link = image.add_inode(Inode {
            attributes: FileAttributes::new().with_reparse_point(true),
            reparse_tag: ReparseTag::SYMLINK,
            unnamed_stream: StreamRef::ByHash(Sha1Hash::of(b"link")),
            ..Default::default()
        });
        let l = image.add_child(image.root(), "l", link);
        image.set_short_name(l, "L~1");
        image
    }

    #[test]
    fn test_tally_counts() {
        let image = image_with_links_and_symlink();
        let tally = tally(&image, image.root());
        assert_eq!(tally.hard_links, 1);
        assert_eq!(tally.reparse_points, 1);
        assert_eq!(tally.symlink_reparse_points, 1);
        assert_eq!(tally.other_reparse_points, 0);
        assert_eq!(tally.security_descriptors, 1);
        assert_eq!(tally.short_names, 1);
    }

    #[test]
    fn test_check_linked_mode_requirements() {
        let image = image_with_links_and_symlink();
        let required = tally(&image, image.root());
        let no_links = VolumeCapabilities::default();

        let flags = ExtractFlags {
            hardlink: true,
            ..Default::default()
        };
        assert!(matches!(
            check(&required, &no_links, flags, "test"),
            Err(Error::Unsupported(_))
        ));

        let flags = ExtractFlags {
            symlink: true,
            ..Default::default()
        };
        assert!(matches!(
            check(&required, &no_links, flags, "test"),
            Err(Error::Unsupported(_))
        ));

        // Without link modes the same gaps only warn.
        assert!(check(&required, &no_links, ExtractFlags::default(), "test").is_ok());
    }

    #[test]
    fn test_check_strictness() {
        let image = image_with_links_and_symlink();
        let required = tally(&image, image.root());
        let caps = VolumeCapabilities {
            hard_links: true,
            symlink_reparse_points: true,
            timestamps: true,
            ..Default::default()
        };

        let strict_acls = ExtractFlags {
            strict_acls: true,
            ..Default::default()
        };
        assert!(check(&required, &caps, strict_acls, "test").is_err());

        let strict_short = ExtractFlags {
            strict_short_names: true,
            ..Default::default()
        };
        assert!(check(&required, &caps, strict_short, "test").is_err());

        let strict_times = ExtractFlags {
            strict_timestamps: true,
            ..Default::default()
        };
        assert!(check(&required, &caps, strict_times, "test").is_ok());
    }
}
