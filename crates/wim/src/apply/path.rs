//! Per-dentry name resolution and extraction-path assembly.
//!
//! Every dentry either receives a name in the backend's vocabulary or is
//! skipped (with its whole subtree). Skips come from unsupported inode
//! features, `.`/`..` entries, case-insensitive collisions on
//! case-insensitive targets, and names the target cannot represent; the
//! `REPLACE_INVALID_FILENAMES` / `ALL_CASE_CONFLICTS` flags turn the
//! latter two into renames.

use log::warn;

use crate::apply::ApplyContext;
use crate::backend::{BackendOptions, VolumeCapabilities};
use crate::image::{DentryId, Inode};
use crate::Result;

/// Whether the dentry's inode can be represented at all on this volume.
fn dentry_supported(inode: &Inode, caps: &VolumeCapabilities) -> bool {
    if inode.is_reparse_point() {
        return caps.reparse_points
            || (caps.symlink_reparse_points && inode.is_symlink());
    }
    true
}

fn is_dot_or_dotdot(units: &[u16]) -> bool {
    matches!(units, [0x2e] | [0x2e, 0x2e])
}

/// Checks a name against the backend's forbidden set; with `fix`, the
/// offending characters are replaced in place instead.
fn name_valid(units: &mut [u16], opts: &BackendOptions, fix: bool) -> bool {
    if units.is_empty() {
        return true;
    }
    let replacement = opts.name_replacement_char as u16;
    let forbidden: Vec<u16> = opts
        .forbidden_name_chars
        .iter()
        .map(|&c| c as u16)
        .collect();

    for i in 0..units.len() {
        if forbidden.contains(&units[i]) {
            if fix {
                units[i] = replacement;
            } else {
                return false;
            }
        }
    }
    if opts.forbid_trailing_space_dot {
        let last = units.len() - 1;
        if units[last] == b' ' as u16 || units[last] == b'.' as u16 {
            if fix {
                units[last] = replacement;
            } else {
                return false;
            }
        }
    }
    true
}

fn mark_subtree_skipped(ctx: &mut ApplyContext<'_, '_>, root: DentryId) {
    let image = ctx.image;
    let _ = image.walk_pre(root, &mut |_, id| {
        ctx.dentry_scratch_mut(id).skipped = true;
        Ok(())
    });
}

/// Computes the extraction name of every dentry in the subtree, marking
/// skips. Decisions depend only on the tree, the flags, and the backend,
/// so a second run yields identical results.
pub(crate) fn compute_names(ctx: &mut ApplyContext<'_, '_>) -> Result<()> {
    let image = ctx.image;
    image.walk_pre(ctx.root, &mut |_, id| calculate_name(ctx, id))
}

fn calculate_name(ctx: &mut ApplyContext<'_, '_>, id: DentryId) -> Result<()> {
    if id == ctx.root || ctx.dentry_scratch(id).skipped {
        return Ok(());
    }
    let image = ctx.image;
    let dentry = image.dentry(id);
    let inode = image.inode(dentry.inode);

    if !dentry_supported(inode, &ctx.caps) {
        mark_subtree_skipped(ctx, id);
        return Ok(());
    }

    if is_dot_or_dotdot(dentry.name.units()) {
        // Images should not contain these entries; never extract them.
        warn!(
            "Skipping extraction of unexpected . or .. file \"{}\"",
            image.full_path(id)
        );
        mark_subtree_skipped(ctx, id);
        return Ok(());
    }

    if !ctx.caps.case_sensitive_filenames {
        // The earliest sibling of a case-colliding set keeps its name;
        // the rest are skipped or renamed.
        if let Some(&other) = dentry.case_conflicts.iter().find(|&&other| other < id) {
            if ctx.flags.all_case_conflicts {
                warn!(
                    "\"{}\" has the same case-insensitive name as \"{}\"; \
                     extracting dummy name instead",
                    image.full_path(id),
                    image.full_path(other)
                );
                return replace_name(ctx, id);
            }
            warn!(
                "Not extracting \"{}\": has same case-insensitive name as \"{}\"",
                image.full_path(id),
                image.full_path(other)
            );
            mark_subtree_skipped(ctx, id);
            return Ok(());
        }
    }

    let mut units = dentry.name.units().to_vec();
    if name_valid(&mut units, &ctx.opts, false) {
        if let Ok(name) = String::from_utf16(&units) {
            ctx.dentry_scratch_mut(id).name = Some(name);
            return Ok(());
        }
    }

    if ctx.flags.replace_invalid_filenames {
        warn!(
            "\"{}\" has an invalid filename that is not supported on this platform; \
             extracting dummy name instead",
            image.full_path(id)
        );
        replace_name(ctx, id)
    } else {
        warn!(
            "Not extracting \"{}\": has an invalid filename that is not supported \
             on this platform",
            image.full_path(id)
        );
        mark_subtree_skipped(ctx, id);
        Ok(())
    }
}

/// Builds the substitute name: forbidden characters replaced plus a
/// uniquifying suffix numbered per operation.
fn replace_name(ctx: &mut ApplyContext<'_, '_>, id: DentryId) -> Result<()> {
    let mut units = ctx.image.dentry(id).name.units().to_vec();
    name_valid(&mut units, &ctx.opts, true);
    ctx.invalid_seq += 1;
    let name = format!(
        "{} (invalid filename #{})",
        String::from_utf16_lossy(&units),
        ctx.invalid_seq
    );
    ctx.dentry_scratch_mut(id).name = Some(name);
    Ok(())
}

/// Assembles the extraction path of a dentry: backend prefix, then the
/// target (or its resolved absolute form), then the computed names from
/// the extraction root down. Returns `None` for skipped dentries and for
/// paths exceeding the backend's limit, which only warns.
pub(crate) fn build_extraction_path(
    ctx: &ApplyContext<'_, '_>,
    dentry: DentryId,
) -> Option<String> {
    if ctx.dentry_scratch(dentry).skipped {
        return None;
    }

    let target_prefix: &str = if ctx.opts.requires_realtarget_in_paths {
        ctx.realtarget.as_deref().unwrap_or(&ctx.target)
    } else if ctx.opts.requires_target_in_paths {
        &ctx.target
    } else {
        ""
    };

    let mut components: Vec<&str> = Vec::new();
    let mut d = dentry;
    while d != ctx.root {
        components.push(ctx.dentry_scratch(d).name.as_deref()?);
        d = ctx.image.dentry(d).parent;
    }

    let nchars = ctx.opts.path_prefix.chars().count()
        + target_prefix.chars().count()
        + components
            .iter()
            .map(|c| c.chars().count() + 1)
            .sum::<usize>()
        + 1;
    if nchars > ctx.opts.path_max {
        warn!(
            "\"{}\": Path too long to extract",
            ctx.image.full_path(dentry)
        );
        return None;
    }

    let mut path = String::with_capacity(nchars);
    path.push_str(&ctx.opts.path_prefix);
    path.push_str(target_prefix);
    for component in components.iter().rev() {
        path.push(ctx.opts.path_separator);
        path.push_str(component);
    }
    Some(path)
}
