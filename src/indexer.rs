//! Drives the gzip engine and the tar parser together over one input
//! stream, producing a [`TOC`]: peek to confirm the declared kind, feed
//! decompressed bytes to the tar parser, and stop to capture a
//! [`Checkpoint`] whenever the gzip engine crosses a span boundary.
//!
//! Mid-stream I/O or tar errors don't simply fail the whole run: the
//! caller gets back whatever prefix of the TOC was parsed before the
//! error, marked [`TOC::incomplete`], mirroring the `Next()`-to-EOF vs.
//! `TOC()`-early contract of the reference indexer.

use std::io::{self, Read};

use tar::Archive;

use crate::error::{Result, ZtocError};
use crate::gzip::{CheckpointingReader, DEFAULT_SPAN_SIZE};
use crate::peek::{self, Kind};
use crate::toc::{entry_to_tocfile, TOCFile, TOC};

/// Counts bytes read through it; used for the plain-tar path, where
/// there's no gzip engine to report `total_in`/`total_out`.
struct CountingReader<R> {
    reader: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Builds a [`TOC`] over `input`, which may be plain tar, gzip, or
/// tar+gzip. `declared` overrides the sniffed kind when `Some` (the
/// caller asserted a kind); when `None` the peek result is used as-is.
/// `span_size` is the target compressed-byte distance between
/// checkpoints (ignored for plain tar).
pub fn build_index<R: Read>(
    mut input: R,
    span_size: u64,
    declared: Option<Kind>,
) -> Result<TOC> {
    let (sniffed, peeked) = peek::peek(&mut input).map_err(ZtocError::Io)?;
    let kind = declared.unwrap_or(sniffed);
    if kind == Kind::Unknown {
        return Err(ZtocError::UnsupportedKind);
    }

    let chained = io::Cursor::new(peeked).chain(input);

    match kind {
        Kind::Tar => build_from_tar(chained),
        Kind::Gzip | Kind::TarGzip => {
            build_from_gzip(chained, span_size, kind, declared.is_some())
        }
        Kind::Unknown => unreachable!("handled above"),
    }
}

fn build_from_tar<R: Read>(reader: R) -> Result<TOC> {
    let reader = CountingReader { reader, count: 0 };
    let (files, incomplete, total) = drain_entries(reader, |r| r.count);

    Ok(TOC {
        kind: Kind::Tar,
        span_size: 0,
        total_in: total,
        total_out: total,
        checkpoints: Vec::new(),
        files,
        incomplete,
    })
}

fn build_from_gzip<R: Read>(reader: R, span_size: u64, kind: Kind, declared: bool) -> Result<TOC> {
    let span_size = if span_size == 0 {
        DEFAULT_SPAN_SIZE
    } else {
        span_size
    };
    let (reader, log) = CheckpointingReader::new(reader, span_size).map_err(ZtocError::Io)?;

    let (files, incomplete, _) = drain_entries(reader, |_| 0);

    // An undeclared gzip stream that parses as tar to completion really is
    // tar+gzip; a caller-declared kind is never second-guessed.
    let kind = if kind == Kind::Gzip && !declared && !incomplete {
        Kind::TarGzip
    } else {
        kind
    };

    let log = log.borrow();
    Ok(TOC {
        kind,
        span_size,
        total_in: log.total_in,
        total_out: log.total_out,
        checkpoints: log.checkpoints.clone(),
        files,
        incomplete,
    })
}

/// Runs the tar entry iterator to completion or to its first error,
/// returning every file parsed so far plus whether an error cut it
/// short. `final_count` reads a byte counter off the (possibly moved)
/// reader after the archive is done with it (used only by the
/// plain-tar path, which has no [`CheckpointLog`] to consult instead).
fn drain_entries<R, F>(reader: R, final_count: F) -> (Vec<TOCFile>, bool, u64)
where
    R: Read,
    F: Fn(&R) -> u64,
{
    let mut archive = Archive::new(reader);
    archive.set_unpack_xattrs(true);
    archive.set_ignore_zeros(true);

    let mut files = Vec::new();
    let mut incomplete = false;

    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "failed to open tar entry iterator");
            return (files, true, 0);
        }
    };

    for entry in entries {
        match entry {
            Ok(entry) => match entry_to_tocfile(entry) {
                Ok(file) => files.push(file),
                Err(e) => {
                    tracing::warn!(error = %e, "tar header parse error; stopping early");
                    incomplete = true;
                    break;
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "tar entry read error; stopping early");
                incomplete = true;
                break;
            }
        }
    }

    let total = final_count(&archive.into_inner());
    (files, incomplete, total)
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::{Builder, Header};

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip_of(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn indexes_empty_tar_gz() {
        let tar_bytes = build_tar(&[]);
        let gz = gzip_of(&tar_bytes);
        let toc = build_index(io::Cursor::new(gz), 4096, None).unwrap();
        assert_eq!(toc.kind, Kind::TarGzip);
        assert!(toc.files.is_empty());
        assert!(!toc.checkpoints.is_empty());
        assert!(!toc.incomplete);
    }

    #[test]
    fn indexes_single_file_tar_gz() {
        let tar_bytes = build_tar(&[("hello.txt", b"hello world")]);
        let gz = gzip_of(&tar_bytes);
        let toc = build_index(io::Cursor::new(gz), 4096, None).unwrap();
        assert_eq!(toc.files.len(), 1);
        assert_eq!(toc.files[0].name, "hello.txt");
        assert_eq!(toc.files[0].size, 11);
    }

    #[test]
    fn indexes_plain_tar() {
        let tar_bytes = build_tar(&[("a", b"1"), ("b", b"22")]);
        let toc = build_index(io::Cursor::new(tar_bytes), 4096, None).unwrap();
        assert_eq!(toc.kind, Kind::Tar);
        assert_eq!(toc.files.len(), 2);
        assert!(toc.checkpoints.is_empty());
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = build_index(io::Cursor::new(vec![1, 2, 3, 4]), 4096, None).unwrap_err();
        assert!(matches!(err, ZtocError::UnsupportedKind));
    }
}
