//! Applying a pipable WIM from a non-seekable byte stream.

mod common;

use std::io::Cursor;

use binrw::BinWrite;
use common::{Call, MockApplicator, dir_inode};
use wim::pipe::{
    PWM_MAGIC, PWM_STREAM_MAGIC, PwmStreamHeader, RESHDR_FLAG_METADATA, ResourceHeaderDisk,
    WimHeaderDisk, extract_image_from_pipe,
};
use wim::{
    Error, ExtractFlags, Image, ImageSelect, Inode, ProgressMsg, Sha1Hash, StreamRef,
};

fn wim_header(image_count: u32, part_number: u16) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    WimHeaderDisk {
        magic: PWM_MAGIC,
        header_size: 208,
        version: 0x10d00,
        flags: 0,
        chunk_size: 32768,
        guid: [0; 16],
        part_number,
        total_parts: 1,
        image_count,
        lookup_table: ResourceHeaderDisk::default(),
        xml_data: ResourceHeaderDisk::default(),
        boot_metadata: ResourceHeaderDisk::default(),
        boot_index: 0,
        integrity: ResourceHeaderDisk::default(),
        unused: [0; 60],
    }
    .write(&mut cursor)
    .unwrap();
    let bytes = cursor.into_inner();
    assert_eq!(bytes.len(), 208);
    bytes
}

fn frame(hash: Sha1Hash, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    PwmStreamHeader {
        magic: PWM_STREAM_MAGIC,
        uncompressed_size: body.len() as u64,
        hash,
        flags,
    }
    .write(&mut cursor)
    .unwrap();
    let mut bytes = cursor.into_inner();
    bytes.extend_from_slice(body);
    bytes
}

fn xml_body(total_bytes: u64) -> Vec<u8> {
    let text = format!(
        "<WIM><TOTALBYTES>100000</TOTALBYTES><IMAGE INDEX=\"1\"><NAME>only</NAME>\
         <TOTALBYTES>{total_bytes}</TOTALBYTES></IMAGE></WIM>"
    );
    std::iter::once(0xfeffu16)
        .chain(text.encode_utf16())
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// The image: `a1` and `a2` both carry stream A, `b` carries stream B;
/// nothing references stream C.
fn pipe_image(a: &[u8], b: &[u8]) -> Image {
    let mut image = Image::new(dir_inode());
    for name in ["a1", "a2"] {
        let inode = image.add_inode(Inode {
            unnamed_stream: StreamRef::ByHash(Sha1Hash::of(a)),
            ..Default::default()
        });
        image.add_child(image.root(), name, inode);
    }
    let inode = image.add_inode(Inode {
        unnamed_stream: StreamRef::ByHash(Sha1Hash::of(b)),
        ..Default::default()
    });
    image.add_child(image.root(), "b", inode);
    image
}

fn pipable_wim(a: &[u8], b: &[u8], c: &[u8], image_total: u64) -> Vec<u8> {
    let mut bytes = wim_header(1, 1);
    bytes.extend(frame(Sha1Hash::ZERO, RESHDR_FLAG_METADATA, &xml_body(image_total)));
    bytes.extend(frame(Sha1Hash::ZERO, RESHDR_FLAG_METADATA, b"image metadata"));
    bytes.extend(frame(Sha1Hash::of(a), 0, a));
    bytes.extend(frame(Sha1Hash::of(b), 0, b));
    bytes.extend(frame(Sha1Hash::of(c), 0, c));
    bytes
}

#[test]
fn test_pipe_extraction_matches_streams_by_digest() {
    let a = vec![0xaau8; 2000];
    let b = b"stream b".to_vec();
    let c = b"stream c, never requested".to_vec();
    // Deliberate under-estimate, as pipe totals are.
    let wim = pipable_wim(&a, &b, &c, 100);

    let mut events = Vec::new();
    let mut callback = |msg: ProgressMsg, info: &wim::ProgressInfo| {
        events.push((msg, info.completed_bytes, info.total_bytes));
    };
    let mut mock = MockApplicator::basic();
    let mut seen_metadata = Vec::new();
    extract_image_from_pipe(
        &wim[..],
        ImageSelect::Index(1),
        "out",
        ExtractFlags::default(),
        &mut mock,
        &mut |metadata| {
            seen_metadata = metadata.to_vec();
            Ok(pipe_image(&a, &b))
        },
        Some(&mut callback),
    )
    .unwrap();

    assert_eq!(seen_metadata, b"image metadata");

    // A was needed twice: spilled once, written to both names. B was
    // written once. C was never requested and never extracted.
    let writes = mock.unnamed_writes();
    assert_eq!(
        writes
            .iter()
            .filter(|(_, data)| *data == a)
            .map(|(path, _)| path.as_str())
            .collect::<Vec<_>>(),
        vec!["out/a1", "out/a2"]
    );
    assert_eq!(
        writes.iter().filter(|(_, data)| *data == b).count(),
        1
    );
    assert_eq!(writes.iter().filter(|(_, data)| *data == c).count(), 0);
    assert_eq!(writes.len(), 3);

    // Skeleton completes before any stream data flows.
    let last_create = mock
        .calls
        .iter()
        .rposition(|call| matches!(call, Call::CreateFile(_) | Call::CreateDir(_)))
        .unwrap();
    let first_write = mock.index_of(|call| matches!(call, Call::UnnamedStream { .. }));
    assert!(last_create < first_write);

    // The estimate was low; completion still reaches it before the
    // final events.
    let last_streams = events
        .iter()
        .rev()
        .find(|(msg, _, _)| *msg == ProgressMsg::Streams)
        .unwrap();
    assert!(last_streams.1 >= last_streams.2);
    assert_eq!(last_streams.2, 100);
    assert_eq!(*events.last().unwrap(), (ProgressMsg::ImageEnd, 4008, 100));
}

#[test]
fn test_pipe_rejects_non_pipable_input() {
    let mut bytes = wim_header(1, 1);
    bytes[0..8].copy_from_slice(b"MSWIM\0\0\0");
    let result = extract_image_from_pipe(
        &bytes[..],
        ImageSelect::Index(1),
        "out",
        ExtractFlags::default(),
        &mut MockApplicator::basic(),
        &mut |_| unreachable!(),
        None,
    );
    assert!(matches!(result, Err(Error::NotPipable)));
}

#[test]
fn test_pipe_rejects_later_split_parts() {
    let bytes = wim_header(1, 2);
    let result = extract_image_from_pipe(
        &bytes[..],
        ImageSelect::Index(1),
        "out",
        ExtractFlags::default(),
        &mut MockApplicator::basic(),
        &mut |_| unreachable!(),
        None,
    );
    assert!(matches!(result, Err(Error::InvalidPipableWim(_))));
}

#[test]
fn test_pipe_rejects_bad_selectors() {
    let wim = pipable_wim(b"a", b"b", b"c", 10);

    let result = extract_image_from_pipe(
        &wim[..],
        ImageSelect::All,
        "out",
        ExtractFlags::default(),
        &mut MockApplicator::basic(),
        &mut |_| unreachable!(),
        None,
    );
    assert!(matches!(result, Err(Error::InvalidImage(_))));

    let result = extract_image_from_pipe(
        &wim[..],
        ImageSelect::Name("wrong".to_string()),
        "out",
        ExtractFlags::default(),
        &mut MockApplicator::basic(),
        &mut |_| unreachable!(),
        None,
    );
    assert!(matches!(result, Err(Error::InvalidImage(_))));

    let mut flags = ExtractFlags::default();
    flags.to_stdout = true;
    let result = extract_image_from_pipe(
        &wim[..],
        ImageSelect::Index(1),
        "out",
        flags,
        &mut MockApplicator::basic(),
        &mut |_| unreachable!(),
        None,
    );
    assert!(matches!(result, Err(Error::InvalidParam(_))));
}

#[test]
fn test_pipe_rejects_inconsistent_image_count() {
    // Header says two images, XML declares one.
    let mut bytes = wim_header(2, 1);
    bytes.extend(frame(Sha1Hash::ZERO, RESHDR_FLAG_METADATA, &xml_body(10)));
    let result = extract_image_from_pipe(
        &bytes[..],
        ImageSelect::Index(1),
        "out",
        ExtractFlags::default(),
        &mut MockApplicator::basic(),
        &mut |_| unreachable!(),
        None,
    );
    assert!(matches!(result, Err(Error::XmlInconsistent(_))));
}
