use std::fs::{self, File};
use std::io::{self, prelude::*};
use std::path::PathBuf;

use anyhow::*;
use camino::{Utf8Component, Utf8Path};
use log::*;
use structopt::*;

use raz::*;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "unzip",
    about = "Dumps a .zip or .rar file into the current directory, or one of its files to stdout"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Change to the given directory before perfoming any operations.
    #[structopt(short = "C", long)]
    directory: Option<PathBuf>,

    /// List entries instead of extracting them.
    #[structopt(short, long)]
    list: bool,

    /// Where in ENTRY to start writing from
    #[structopt(long, default_value = "0")]
    offset: u64,

    /// How many bytes of ENTRY to write (all of them if unset)
    #[structopt(long)]
    length: Option<u64>,

    /// How many bytes to ask for with each read
    #[structopt(long, default_value = "65536")]
    read_size: u64,

    #[structopt(name("archive"))]
    archive_path: PathBuf,

    /// Write just this file to stdout.
    #[structopt(name("ENTRY"))]
    entry: Option<String>,
}

type Archive = RandomAccessArchive<FileSource, MemoryHeaderCache>;

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    if args.read_size == 0 {
        bail!("--read-size must be positive");
    }

    // Resolve the archive before changing directories.
    let archive_path = fs::canonicalize(&args.archive_path)
        .with_context(|| format!("Couldn't find {}", args.archive_path.display()))?;

    if let Some(chto) = &args.directory {
        std::env::set_current_dir(chto)
            .with_context(|| format!("Couldn't set working directory to {}", chto.display()))?;
    }

    info!("Opening {:#?}", archive_path);
    let source = FileSource::open(&archive_path).context("Couldn't open archive")?;
    let mut archive = RandomAccessArchive::new(source, MemoryHeaderCache::new());
    archive.init().context("Couldn't load archive")?;

    let result = if args.list {
        list(&mut archive)
    } else if let Some(wanted) = &args.entry {
        dump_one(&mut archive, wanted, &args)
    } else {
        extract_all(&mut archive, args.read_size)
    };

    let stats = archive.stats();
    debug!(
        "{} reinitializations, {} bytes discarded, {} window hits",
        stats.reinitializations, stats.discarded_bytes, stats.window_hits
    );
    archive.cleanup().context("Couldn't close archive")?;
    result
}

fn list(archive: &mut Archive) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    while let Some(entry) = archive.list_next_entry()? {
        writeln!(
            out,
            "{:06o} {:>12} {} {}",
            entry.mode, entry.size, entry.last_modified, entry.path
        )?;
    }
    Ok(())
}

fn dump_one(archive: &mut Archive, wanted: &str, args: &Opt) -> Result<()> {
    let entry = loop {
        match archive.list_next_entry()? {
            Some(entry) if entry.path == wanted => break entry,
            Some(_) => {}
            None => bail!("No {} in the archive", wanted),
        }
    };
    if entry.is_dir() {
        bail!("{} is a directory", wanted);
    }

    let end = match args.length {
        Some(length) => args.offset.saturating_add(length).min(entry.size),
        None => entry.size,
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    copy_range(archive, args.offset, end, args.read_size, &mut out)
        .with_context(|| format!("Couldn't read {}", wanted))?;
    out.flush()?;
    Ok(())
}

fn extract_all(archive: &mut Archive, read_size: u64) -> Result<()> {
    while let Some(entry) = archive.list_next_entry()? {
        check_extraction_path(&entry.path)?;
        if entry.is_dir() {
            fs::create_dir_all(&entry.path)
                .with_context(|| format!("Couldn't create directory {}", entry.path))?;
        } else {
            if let Some(parent) = entry.path.parent().filter(|p| !p.as_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Couldn't create directory {}", parent))?;
            }
            let mut sink = File::create(&entry.path)
                .with_context(|| format!("Couldn't create file {}", entry.path))?;
            copy_range(archive, 0, entry.size, read_size, &mut sink)
                .with_context(|| format!("Couldn't extract {}", entry.path))?;
        }
    }
    Ok(())
}

/// Refuses paths that would land outside the current directory.
fn check_extraction_path(path: &Utf8Path) -> Result<()> {
    for component in path.components() {
        match component {
            Utf8Component::Normal(_) | Utf8Component::CurDir => {}
            Utf8Component::ParentDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                bail!("Refusing to extract {} outside the current directory", path)
            }
        }
    }
    Ok(())
}

/// Writes bytes `start..end` of the current entry to `sink`,
/// decoding the next chunk while the last one is written.
fn copy_range<W: Write>(
    archive: &mut Archive,
    start: u64,
    end: u64,
    read_size: u64,
    sink: &mut W,
) -> Result<()> {
    let mut offset = start;
    while offset < end {
        let chunk = archive.read_at(offset, read_size.min(end - offset))?;
        if chunk.is_empty() {
            bail!("Entry ended at {} of {} bytes", offset, end);
        }
        sink.write_all(chunk)?;
        offset += chunk.len() as u64;
        archive.maybe_decompress_ahead();
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extraction_stays_put() {
        assert!(check_extraction_path(Utf8Path::new("a/b.txt")).is_ok());
        assert!(check_extraction_path(Utf8Path::new("./a/")).is_ok());

        assert!(check_extraction_path(Utf8Path::new("../evil")).is_err());
        assert!(check_extraction_path(Utf8Path::new("a/../../evil")).is_err());
        assert!(check_extraction_path(Utf8Path::new("/etc/passwd")).is_err());
    }
}
