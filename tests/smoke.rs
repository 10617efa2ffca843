use std::io::prelude::*;

use anyhow::{Context, Result};
use log::*;
use memmap2::Mmap;
use rayon::prelude::*;

use raz::*;

mod common;
use common::*;

fn hello_bye(deflate: bool) -> Vec<u8> {
    let builder = ZipBuilder::new();
    let builder = if deflate {
        builder
            .deflated("a.txt", b"Hello World!")
            .deflated("b.txt", b"Bye!!")
    } else {
        builder.stored("a.txt", b"Hello World!").stored("b.txt", b"Bye!!")
    };
    builder.build()
}

/// Lists every entry, reading each one out in a few pieces.
fn read_everything<S: ByteSource, C: HeaderCache>(
    archive: &mut RandomAccessArchive<S, C>,
) -> Result<Vec<(Entry, Vec<u8>)>> {
    let mut everything = Vec::new();
    while let Some(entry) = archive.list_next_entry()? {
        let mut contents = Vec::new();
        loop {
            let chunk = archive.read_at(contents.len() as u64, 7)?;
            if chunk.is_empty() {
                break;
            }
            contents.extend_from_slice(chunk);
            archive.maybe_decompress_ahead();
        }
        debug!("Read {} bytes of {}", contents.len(), entry.path);
        everything.push((entry, contents));
    }
    Ok(everything)
}

#[test]
fn hello_bye_scenario() -> Result<()> {
    init_logging();

    for deflate in [false, true] {
        let bytes = hello_bye(deflate);
        let mut archive = RandomAccessArchive::new(MemorySource::from_bytes(bytes), NoHeaderCache);
        archive.init()?;

        let a = archive.list_next_entry()?.context("Missing a.txt")?;
        assert_eq!(a.path, "a.txt");
        assert_eq!(a.size, 12);
        assert!(a.is_file());
        assert_eq!(a.last_modified.to_string(), TIMESTAMP);

        assert_eq!(archive.read_at(0, 5)?, b"Hello");
        // Clamped to what's left
        assert_eq!(archive.read_at(5, 20)?, b" World!");
        assert!(archive.read_at(12, 20)?.is_empty());

        let b = archive.list_next_entry()?.context("Missing b.txt")?;
        assert_eq!(b.path, "b.txt");
        assert_eq!(b.size, 5);
        // A new entry starts from scratch, not from a.txt's leftovers.
        assert_eq!(archive.read_at(0, 20)?, b"Bye!!");
        assert!(archive.read_at(5, 20)?.is_empty());

        assert!(archive.list_next_entry()?.is_none());
        assert_eq!(archive.stats().reinitializations, 0);
        archive.cleanup()?;
    }
    Ok(())
}

#[test]
fn listing_in_archive_order() -> Result<()> {
    init_logging();

    let bytes = ZipBuilder::new()
        .directory("hello/")
        .stored("hello/hi.txt", b"hi there\n")
        .deflated("hello/rip.txt", &sample_text(3000, 1))
        .unix_mode(0o100755)
        .stored("hello/sr71.txt", b"")
        .build();
    let mut archive = RandomAccessArchive::new(MemorySource::from_bytes(bytes), NoHeaderCache);
    archive.init()?;

    let mut listed = Vec::new();
    while let Some(entry) = archive.list_next_entry()? {
        listed.push(entry);
    }
    let paths: Vec<&str> = listed.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(
        paths,
        ["hello/", "hello/hi.txt", "hello/rip.txt", "hello/sr71.txt"]
    );
    assert!(listed[0].is_dir());
    assert_eq!(listed[0].permissions(), 0o755);
    assert_eq!(listed[2].size, 3000);
    assert_eq!(listed[2].permissions(), 0o755);
    assert_eq!(listed[3].permissions(), 0o644);

    // The end stays the end.
    assert!(archive.list_next_entry()?.is_none());
    Ok(())
}

#[test]
fn file_backed() -> Result<()> {
    init_logging();

    let text = sample_text(100_000, 2);
    let bytes = ZipBuilder::new()
        .stored("small.txt", b"small")
        .deflated("big.txt", &text)
        .build();

    let mut temp = tempfile::NamedTempFile::new()?;
    temp.write_all(&bytes)?;
    temp.flush()?;

    let source = FileSource::open(temp.path()).context("Couldn't open archive")?;
    let mut archive = RandomAccessArchive::new(source, MemoryHeaderCache::new());
    archive.init()?;

    let everything = read_everything(&mut archive)?;
    assert_eq!(everything.len(), 2);
    assert_eq!(everything[0].1, b"small");
    assert_eq!(everything[1].1, text);
    archive.cleanup()?;
    Ok(())
}

#[test]
fn memory_mapped() -> Result<()> {
    init_logging();

    let text = sample_text(50_000, 3);
    let bytes = ZipBuilder::new()
        .deflated("mapped.txt", &text)
        .data_descriptor()
        .build();

    let mut temp = tempfile::tempfile()?;
    temp.write_all(&bytes)?;
    info!("Memory mapping a {} byte archive", bytes.len());
    let mapping = unsafe { Mmap::map(&temp).context("Couldn't mmap archive")? };

    let mut archive = RandomAccessArchive::new(MemorySource::from_bytes(&mapping[..]), NoHeaderCache);
    archive.init()?;
    archive.list_next_entry()?.context("Empty archive")?;
    assert_eq!(archive.read_at(40_000, 10)?, &text[40_000..40_010]);
    assert_eq!(archive.read_at(10, 10)?, &text[10..20]);
    assert_eq!(archive.stats().reinitializations, 1);
    Ok(())
}

#[test]
fn sessions_in_parallel() -> Result<()> {
    init_logging();

    let contents: Vec<Vec<u8>> = (0..8).map(|i| sample_text(20_000 + i * 1000, i as u32)).collect();
    let mut builder = ZipBuilder::new();
    for (i, text) in contents.iter().enumerate() {
        builder = builder.deflated(&format!("file{i}.txt"), text);
    }
    let bytes = builder.build();

    // Each session gets its own source over the shared bytes.
    (0..contents.len()).into_par_iter().try_for_each(|wanted| -> Result<()> {
        let mut archive =
            RandomAccessArchive::new(MemorySource::from_bytes(&bytes[..]), NoHeaderCache);
        archive.init()?;
        let mut entry = archive.list_next_entry()?.context("Ran out of entries")?;
        for _ in 0..wanted {
            entry = archive.list_next_entry()?.context("Ran out of entries")?;
        }
        assert_eq!(entry.path.as_str(), format!("file{wanted}.txt"));

        let text = &contents[wanted];
        for offset in [15_000, 3, 19_999, 0, 7_777] {
            let got = archive.read_at(offset as u64, 100)?;
            let end = (offset + 100).min(text.len());
            assert_eq!(got, &text[offset..end]);
        }
        Ok(())
    })?;
    Ok(())
}

#[test]
fn files_in_archives() -> Result<()> {
    init_logging();

    let inputs = vec![
        ("zip", ZipBuilder::new().stored("x", b"stored").deflated("y", b"deflated").build()),
        ("rar", RarBuilder::new().stored("x", b"stored").stored("y", b"also stored").build()),
    ];
    for (kind, bytes) in inputs {
        info!("Reading the {kind} archive");
        let mut archive = RandomAccessArchive::new(MemorySource::from_bytes(bytes), NoHeaderCache);
        archive.init()?;
        let everything = read_everything(&mut archive)?;
        let names: Vec<&str> = everything.iter().map(|(e, _)| e.path.as_str()).collect();
        assert_eq!(names, ["x", "y"]);
        assert_eq!(everything[0].1, b"stored");
    }
    Ok(())
}
