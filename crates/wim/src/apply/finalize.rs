//! Finalization: security and timestamps, applied strictly after all
//! content and attributes in depth-first post-order so parent directory
//! timestamps survive the writes inside them.

use log::{error, warn};

use crate::apply::{ApplyContext, path};
use crate::image::DentryId;
use crate::Result;

pub(crate) fn dentry_extract_final(ctx: &mut ApplyContext<'_, '_>, id: DentryId) -> Result<()> {
    let Some(dentry_path) = path::build_extraction_path(ctx, id) else {
        return Ok(());
    };
    apply_security(ctx, &dentry_path, id)?;
    apply_timestamps(ctx, &dentry_path, id)
}

/// Applies the security descriptor or UNIX ownership data, per the flag
/// selection. Failures degrade to warnings without `STRICT_ACLS`, and
/// plain permission denials stay quiet even then.
fn apply_security(ctx: &mut ApplyContext<'_, '_>, dentry_path: &str, id: DentryId) -> Result<()> {
    if ctx.flags.no_acls {
        return Ok(());
    }
    if id == ctx.root && ctx.root_dentry_is_special {
        return Ok(());
    }
    let inode = ctx.image.inode_of(id);

    if ctx.flags.unix_data {
        if let Some(data) = inode.unix_data {
            if let Err(e) = ctx.backend.set_unix_data(dentry_path, &data) {
                if ctx.flags.strict_acls {
                    error!("Failed to set UNIX owner, group, and/or mode on \"{dentry_path}\"");
                    return Err(e);
                }
                warn!("Failed to set UNIX owner, group, and/or mode on \"{dentry_path}\": {e}");
            }
        }
    } else if ctx.caps.security_descriptors && inode.security_id != -1 {
        if let Some(descriptor) = ctx.image.security.get(inode.security_id) {
            let strict = ctx.flags.strict_acls;
            if let Err(e) = ctx
                .backend
                .set_security_descriptor(dentry_path, descriptor, strict)
            {
                if strict {
                    error!("Failed to set security descriptor on \"{dentry_path}\"");
                    return Err(e);
                }
                if !e.is_permission_denied() {
                    warn!("Failed to set security descriptor on \"{dentry_path}\": {e}");
                }
            }
        }
    }
    Ok(())
}

/// Applies the three timestamps; failure is warning-only without
/// `STRICT_TIMESTAMPS`.
fn apply_timestamps(ctx: &mut ApplyContext<'_, '_>, dentry_path: &str, id: DentryId) -> Result<()> {
    if id == ctx.root && ctx.root_dentry_is_special {
        return Ok(());
    }
    if !ctx.caps.timestamps {
        return Ok(());
    }
    let inode = ctx.image.inode_of(id);
    if let Err(e) = ctx.backend.set_timestamps(
        dentry_path,
        inode.creation_time,
        inode.last_write_time,
        inode.last_access_time,
    ) {
        if ctx.flags.strict_timestamps {
            error!("Failed to set timestamps on \"{dentry_path}\"");
            return Err(e);
        }
        warn!("Failed to set timestamps on \"{dentry_path}\": {e}");
    }
    Ok(())
}
