//! Rewriting of reparse targets at extraction time.
//!
//! Images captured with root-relative link targets record where a link
//! pointed inside the captured volume; on apply, those targets must be
//! re-rooted under the extraction target or every absolute link ends up
//! pointing at the live system instead of the extracted tree.

use wim_dtyp::WideString;
use wim_fscc::{REPARSE_POINT_MAX_SIZE, ReparseData, absolute_path_prefix_len};

use crate::{Error, Result};

/// Rewrites an absolute substitute name to point under the resolved
/// extraction target, which must be a drive-absolute path (`X:\...`).
///
/// Returns `Ok(None)` when the target is relative or a volume junction
/// and must be left untouched. The rewritten buffer keeps the `\??\`
/// prefix when one was present, and the print name matches the new
/// target without that prefix.
pub(crate) fn fixup_absolute_target(buf: &[u8], realtarget: &str) -> Result<Option<Vec<u8>>> {
    let mut data = ReparseData::parse(buf)?;

    let rt: Vec<u16> = realtarget.encode_utf16().collect();
    if rt.len() < 3 || rt[0] == 0 || rt[1] != b':' as u16 || rt[2] != b'\\' as u16 {
        return Err(Error::ReparseFixupFailed(realtarget.to_string()));
    }

    let Some(stripped) = absolute_path_prefix_len(data.substitute_name.units(), data.tag) else {
        return Ok(None);
    };
    let remainder = &data.substitute_name.units()[stripped..];

    let mut new_target: Vec<u16> = Vec::with_capacity(6 + rt.len() + remainder.len());
    if stripped == 6 {
        // Keep the \??\ prefix if it was present before.
        new_target.extend("\\??\\".encode_utf16());
    }
    let print_start = new_target.len();
    if stripped != 0 {
        // Drive letter and colon come from the resolved target.
        new_target.push(rt[0]);
        new_target.push(rt[1]);
    }
    new_target.extend_from_slice(&rt[2..]);
    new_target.extend_from_slice(remainder);

    if (new_target.len() * 2 >= REPARSE_POINT_MAX_SIZE)
        || ((new_target.len() - print_start) * 2 >= REPARSE_POINT_MAX_SIZE)
    {
        return Err(Error::ReparseFixupFailed(realtarget.to_string()));
    }

    data.print_name = WideString::from(&new_target[print_start..]);
    data.substitute_name = WideString::from(&new_target[..]);
    Ok(Some(data.to_bytes()?))
}

/// Decodes a reparse buffer into a native symlink target: backslashes
/// become slashes, absolute targets lose their NT/drive prefix and gain
/// a leading slash, and — when fixup is active — absolute targets are
/// prefixed with the resolved extraction target.
pub(crate) fn symlink_target_from_buffer(
    buf: &[u8],
    realtarget: Option<&str>,
) -> Result<String> {
    let data = ReparseData::parse(buf)?;
    let units = data.substitute_name.units();
    let stripped = absolute_path_prefix_len(units, data.tag);
    let remainder = &units[stripped.unwrap_or(0)..];

    let mut target = String::from_utf16_lossy(remainder).replace('\\', "/");
    if stripped.is_some() && !target.starts_with('/') {
        target.insert(0, '/');
    }
    if let Some(realtarget) = realtarget {
        if target.starts_with('/') {
            target = format!("{realtarget}{target}");
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wim_dtyp::WideString;
    use wim_fscc::ReparseTag;

    fn symlink_buffer(substitute: &str, print: &str) -> Vec<u8> {
        ReparseData {
            tag: ReparseTag::SYMLINK,
            substitute_name: WideString::from(substitute),
            print_name: WideString::from(print),
            flags: 0,
        }
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn test_fixup_nt_rooted_target() {
        let buf = symlink_buffer("\\??\\C:\\Windows\\System32", "C:\\Windows\\System32");
        let fixed = fixup_absolute_target(&buf, "D:\\mnt\\out").unwrap().unwrap();
        let data = ReparseData::parse(&fixed).unwrap();
        assert_eq!(
            data.substitute_name,
            "\\??\\D:\\mnt\\out\\Windows\\System32"
        );
        assert_eq!(data.print_name, "D:\\mnt\\out\\Windows\\System32");
    }

    #[test]
    fn test_fixup_drive_target_without_nt_prefix() {
        let buf = symlink_buffer("C:\\Windows", "C:\\Windows");
        let fixed = fixup_absolute_target(&buf, "D:\\out").unwrap().unwrap();
        let data = ReparseData::parse(&fixed).unwrap();
        assert_eq!(data.substitute_name, "D:\\out\\Windows");
    }

    #[test]
    fn test_fixup_leaves_relative_targets() {
        let buf = symlink_buffer("..\\sibling", "..\\sibling");
        assert!(fixup_absolute_target(&buf, "D:\\out").unwrap().is_none());
    }

    #[test]
    fn test_fixup_requires_drive_absolute_realtarget() {
        let buf = symlink_buffer("\\??\\C:\\Windows", "C:\\Windows");
        assert!(matches!(
            fixup_absolute_target(&buf, "/mnt/out"),
            Err(Error::ReparseFixupFailed(_))
        ));
    }

    #[test]
    fn test_symlink_target_absolute() {
        let buf = symlink_buffer("\\??\\C:\\Windows\\System32", "C:\\Windows\\System32");
        assert_eq!(
            symlink_target_from_buffer(&buf, None).unwrap(),
            "/Windows/System32"
        );
        assert_eq!(
            symlink_target_from_buffer(&buf, Some("/mnt/out")).unwrap(),
            "/mnt/out/Windows/System32"
        );
    }

    #[test]
    fn test_symlink_target_relative() {
        let buf = symlink_buffer("..\\sibling\\file", "..\\sibling\\file");
        assert_eq!(
            symlink_target_from_buffer(&buf, Some("/mnt/out")).unwrap(),
            "../sibling/file"
        );
    }
}
