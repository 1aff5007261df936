//! Extraction onto a real POSIX filesystem.

#![cfg(unix)]

mod common;

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::time::SystemTime;

use common::Fixture;
use wim::backend::posix::PosixApplicator;
use wim::{ExtractFlags, FileTime, ImageSelect, Inode, StreamRef, UnixData, extract_image};

fn extract_to(fixture: &mut Fixture, target: &str, flags: ExtractFlags) {
    let mut backend = PosixApplicator::new();
    extract_image(
        &mut fixture.archive,
        &mut fixture.source,
        ImageSelect::Index(1),
        target,
        flags,
        &mut backend,
        None,
    )
    .unwrap();
}

#[test]
fn test_posix_tree_contents() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out");
    let target_str = target.to_str().unwrap().to_string();

    let mut fixture = Fixture::new();
    let root = fixture.root();
    let d = fixture.add_dir(root, "d");
    fixture.add_file(d, "hello", b"hello world");
    fixture.add_file(root, "empty", b"");
    fixture.add_file(root, "one", b"x");

    extract_to(&mut fixture, &target_str, ExtractFlags::default());

    assert_eq!(fs::read(target.join("d/hello")).unwrap(), b"hello world");
    assert_eq!(fs::read(target.join("empty")).unwrap(), b"");
    assert_eq!(fs::read(target.join("one")).unwrap(), b"x");
}

#[test]
fn test_posix_hard_links_share_an_inode() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out");
    let target_str = target.to_str().unwrap().to_string();

    let mut fixture = Fixture::new();
    let root = fixture.root();
    let inode = fixture.file_inode(b"linked contents");
    fixture.image().add_child(root, "h1", inode);
    fixture.image().add_child(root, "h2", inode);

    extract_to(&mut fixture, &target_str, ExtractFlags::default());

    let m1 = fs::metadata(target.join("h1")).unwrap();
    let m2 = fs::metadata(target.join("h2")).unwrap();
    assert_eq!(m1.nlink(), 2);
    assert_eq!(m1.ino(), m2.ino());
    assert_eq!(fs::read(target.join("h2")).unwrap(), b"linked contents");
}

#[test]
fn test_posix_symlink_and_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out");
    let target_str = target.to_str().unwrap().to_string();

    let mut fixture = Fixture::new();
    let root = fixture.root();
    fixture.add_file(root, "file", b"pointee");
    fixture.add_symlink(root, "link", "file");

    extract_to(&mut fixture, &target_str, ExtractFlags::default());

    assert_eq!(
        fs::read_link(target.join("link")).unwrap().to_str(),
        Some("file")
    );

    // The finalizer restored the archived modification time.
    let expected: SystemTime = FileTime::from(131_000_000_000_000_001u64).into();
    let modified = fs::metadata(target.join("file")).unwrap().modified().unwrap();
    assert_eq!(modified, expected);

    // Directory timestamps survive the writes inside them.
    let dir_expected: SystemTime = FileTime::from(130_000_000_000_000_001u64).into();
    let dir_modified = fs::metadata(&target).unwrap().modified().unwrap();
    assert_eq!(dir_modified, dir_expected);
}

#[test]
fn test_posix_unix_data_mode() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out");
    let target_str = target.to_str().unwrap().to_string();

    // Chown to ourselves always succeeds.
    let meta = fs::metadata(dir.path()).unwrap();
    let (uid, gid) = (meta.uid(), meta.gid());

    let mut fixture = Fixture::new();
    let root = fixture.root();
    let file = fixture.add_file(root, "owned", b"contents");
    let inode_id = fixture.image().dentry(file).inode;
    fixture.image().inode_mut(inode_id).unix_data = Some(UnixData {
        uid,
        gid,
        mode: 0o640,
    });

    extract_to(
        &mut fixture,
        &target_str,
        {
            let mut flags = ExtractFlags::default();
            flags.unix_data = true;
            flags
        },
    );

    let meta = fs::metadata(target.join("owned")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
    assert_eq!(meta.uid(), uid);
    assert_eq!(meta.gid(), gid);
}

#[test]
fn test_posix_reextraction_over_existing_tree() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out");
    let target_str = target.to_str().unwrap().to_string();

    let mut fixture = Fixture::new();
    let root = fixture.root();
    let inode = fixture.file_inode(b"fresh");
    fixture.image().add_child(root, "again", inode);
    let stream = fixture.stream(b"relinked");
    let linked = fixture.image().add_inode(Inode {
        unnamed_stream: stream,
        ..Default::default()
    });
    fixture.image().add_child(root, "l1", linked);
    fixture.image().add_child(root, "l2", linked);

    extract_to(&mut fixture, &target_str, ExtractFlags::default());
    // Second run replaces links and rewrites files in place.
    extract_to(&mut fixture, &target_str, ExtractFlags::default());

    assert_eq!(fs::read(target.join("again")).unwrap(), b"fresh");
    assert_eq!(fs::metadata(target.join("l1")).unwrap().nlink(), 2);
}

#[test]
fn test_posix_symlink_fixup_points_into_target() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out");
    let target_str = target.to_str().unwrap().to_string();

    let mut fixture = Fixture::new();
    let root = fixture.root();
    let windows = fixture.add_dir(root, "Windows");
    fixture.add_dir(windows, "System32");
    fixture.add_symlink(root, "sys", "\\??\\C:\\Windows\\System32");

    extract_to(
        &mut fixture,
        &target_str,
        {
            let mut flags = ExtractFlags::default();
            flags.rpfix = true;
            flags
        },
    );

    let link_target = fs::read_link(target.join("sys")).unwrap();
    let resolved = fs::canonicalize(&target).unwrap().join("Windows/System32");
    assert_eq!(link_target.to_str().unwrap(), resolved.to_str().unwrap());
    // The rewritten target actually resolves inside the extraction.
    assert!(fs::metadata(target.join("sys")).unwrap().is_dir());
}

#[test]
fn test_posix_stream_refs_resolved_lazily() {
    // A StreamRef::Empty file extracts as a zero-length file without
    // touching the source.
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out");
    let target_str = target.to_str().unwrap().to_string();

    let mut fixture = Fixture::new();
    let root = fixture.root();
    let inode = fixture.image().add_inode(Inode {
        unnamed_stream: StreamRef::Empty,
        ..Default::default()
    });
    fixture.image().add_child(root, "void", inode);

    extract_to(&mut fixture, &target_str, ExtractFlags::default());
    assert_eq!(fs::read(target.join("void")).unwrap(), b"");
    assert!(fixture.source.reads.is_empty());
}
