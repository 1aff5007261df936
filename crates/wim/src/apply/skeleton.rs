//! Skeleton materialization: files, directories, links, empty named
//! stream slots, attributes, and short names — everything that does not
//! require reading data resources and is not deferred to finalization.

use log::{debug, error};

use crate::apply::{ApplyContext, extract, path};
use crate::image::DentryId;
use crate::Result;

/// Skeleton step for one dentry during a sequential (two-pass)
/// extraction.
pub(crate) fn dentry_extract_skeleton(ctx: &mut ApplyContext<'_, '_>, id: DentryId) -> Result<()> {
    match path::build_extraction_path(ctx, id) {
        Some(dentry_path) => do_extract_skeleton(ctx, &dentry_path, id),
        None => Ok(()),
    }
}

/// Combined step for one dentry during a random-access (single-pass)
/// extraction: skeleton, then immediately all the dentry's streams.
pub(crate) fn dentry_extract(ctx: &mut ApplyContext<'_, '_>, id: DentryId) -> Result<()> {
    let Some(dentry_path) = path::build_extraction_path(ctx, id) else {
        return Ok(());
    };
    do_extract_skeleton(ctx, &dentry_path, id)?;
    extract::extract_streams(ctx, &dentry_path, id, None, None)
}

fn do_extract_skeleton(
    ctx: &mut ApplyContext<'_, '_>,
    dentry_path: &str,
    id: DentryId,
) -> Result<()> {
    let image = ctx.image;
    let inode_id = image.dentry(id).inode;
    let inode = image.inode(inode_id);

    // Linked modes: anything whose contents were already materialized
    // (even by a previous image) becomes a link to that path.
    if ctx.flags.is_linked() {
        if let Some(stream) = ctx.unnamed_stream(id) {
            if let Some(old_path) = ctx.streams.get(stream).extracted_file.clone() {
                if ctx.flags.hardlink {
                    extract_hardlink(ctx, &old_path, dentry_path)?;
                } else {
                    extract_multiimage_symlink(ctx, &old_path, dentry_path, id)?;
                }
                ctx.dentry_scratch_mut(id).was_linked = true;
                return Ok(());
            }
        }
    }

    // Additional dentry of an already-extracted inode: a hard link.
    if let Some(old_path) = ctx.inode_scratch[inode_id.index()].extracted_path.clone() {
        extract_hardlink(ctx, &old_path, dentry_path)?;
        ctx.dentry_scratch_mut(id).was_linked = true;
        return Ok(());
    }

    // Symlinks on volumes without generic reparse points are realized
    // from their reparse data during the stream phase.
    if inode.is_symlink() && !ctx.caps.reparse_points {
        return Ok(());
    }

    // The extraction root was created before the walk.
    if id != ctx.root {
        extract_inode(ctx, dentry_path, id)?;
    }

    // Named streams with contents are created by the stream phase; the
    // empty ones exist only as slots and are created here.
    if ctx.can_extract_named_streams() {
        for (i, entry) in inode.ads.iter().enumerate() {
            if !entry.is_named() || ctx.ads_stream(id, i).is_some() {
                continue;
            }
            ctx.backend
                .extract_named_stream(dentry_path, &entry.name, None)
                .inspect_err(|_| {
                    error!("\"{dentry_path}\": failed to create empty named data stream");
                })?;
        }
    }

    if ctx.caps.file_attributes && !(id == ctx.root && ctx.root_dentry_is_special) {
        ctx.backend
            .set_file_attributes(dentry_path, inode.attributes)
            .inspect_err(|_| {
                error!("Failed to set attributes on \"{dentry_path}\"");
            })?;
    }

    // The extraction root may not keep its original name, so its short
    // name never applies.
    if id != ctx.root && ctx.caps.short_names {
        let short_name = &image.dentry(id).short_name;
        if let Err(e) = ctx.backend.set_short_name(dentry_path, short_name) {
            if ctx.flags.strict_short_names {
                error!("Failed to set short name of \"{dentry_path}\"");
                return Err(e);
            }
            debug!("Ignoring failure to set short name of \"{dentry_path}\": {e}");
        }
    }

    // Remember the path wherever a later dentry may need to link to it.
    if ctx.flags.is_linked() {
        if let Some(stream) = ctx.unnamed_stream(id) {
            ctx.streams.get_mut(stream).extracted_file = Some(dentry_path.to_string());
        }
    } else if inode.nlink > 1 && ctx.caps.hard_links {
        ctx.inode_scratch[inode_id.index()].extracted_path = Some(dentry_path.to_string());
    }
    Ok(())
}

/// Creates the file, directory, or (on symlink-only volumes) symbolic
/// link for an inode.
pub(crate) fn extract_inode(
    ctx: &mut ApplyContext<'_, '_>,
    dentry_path: &str,
    id: DentryId,
) -> Result<()> {
    let inode = ctx.image.inode_of(id);
    if ctx.caps.symlink_reparse_points && !ctx.caps.reparse_points && inode.is_symlink() {
        extract::extract_symlink(ctx, dentry_path, id, None)
    } else if inode.is_directory() {
        ctx.backend.create_directory(dentry_path).inspect_err(|_| {
            error!("Failed to create the directory \"{dentry_path}\"");
        })
    } else {
        ctx.backend.create_file(dentry_path).inspect_err(|_| {
            error!("Failed to create the file \"{dentry_path}\"");
        })
    }
}

fn extract_hardlink(
    ctx: &mut ApplyContext<'_, '_>,
    old_path: &str,
    new_path: &str,
) -> Result<()> {
    debug!("Creating hardlink \"{new_path}\" => \"{old_path}\"");
    ctx.backend
        .create_hard_link(old_path, new_path)
        .inspect_err(|_| {
            error!("Failed to create hardlink \"{new_path}\" => \"{old_path}\"");
        })
}

fn count_path_components(path: &str, separator: char) -> usize {
    path.split(separator).filter(|c| !c.is_empty()).count()
}

/// Symlink-link mode: emit a relative symlink from `new_path` to the
/// already-materialized `old_path`, climbing one component per level
/// between the dentry and the extraction root (plus one extra level in
/// multi-image mode, where each image lives in its own subdirectory of a
/// shared root).
fn extract_multiimage_symlink(
    ctx: &mut ApplyContext<'_, '_>,
    old_path: &str,
    new_path: &str,
    id: DentryId,
) -> Result<()> {
    let separator = ctx.opts.path_separator;

    let mut levels_up = 0usize;
    let mut d = id;
    while d != ctx.root {
        levels_up += 1;
        d = ctx.image.dentry(d).parent;
    }

    let target_prefix: &str = if ctx.opts.requires_realtarget_in_paths {
        ctx.realtarget.as_deref().unwrap_or(&ctx.target)
    } else if ctx.opts.requires_target_in_paths {
        &ctx.target
    } else {
        ""
    };
    let mut target_components = count_path_components(target_prefix, separator);

    if ctx.flags.multi_image {
        levels_up += 1;
        target_components = target_components.saturating_sub(1);
    }

    // Strip all but the last target component from the old path, then
    // climb from the link's directory back to the shared base.
    let old_components: Vec<&str> = old_path
        .split(separator)
        .filter(|c| !c.is_empty())
        .collect();
    let keep_from = (target_components.max(1) - 1).min(old_components.len());
    let mut link_target = String::new();
    for _ in 0..levels_up {
        link_target.push_str("..");
        link_target.push(separator);
    }
    let separator_str = separator.to_string();
    link_target.push_str(&old_components[keep_from..].join(separator_str.as_str()));

    debug!("Creating symlink \"{new_path}\" => \"{link_target}\"");
    ctx.backend
        .create_symlink(&link_target, new_path)
        .inspect_err(|_| {
            error!("Failed to create symlink \"{new_path}\" => \"{link_target}\"");
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_path_components() {
        assert_eq!(count_path_components("/mnt/out", '/'), 2);
        assert_eq!(count_path_components("mnt/out/", '/'), 2);
        assert_eq!(count_path_components("", '/'), 0);
    }
}
