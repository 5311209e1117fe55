//! Tar entry records and the table of contents assembled by the indexer.
//!
//! Tar parsing itself is delegated to the `tar` crate (it already handles
//! USTAR/GNU magic, long-name/long-link, PAX extensions, and GNU
//! base-256 sizes); the work here is turning `tar::Entry` headers into
//! the flat, offset-stamped records a [`crate::gzip::Checkpoint`]-indexed
//! lookup needs, without reading payload bytes through the parser twice.

use std::collections::HashMap;
use std::io::{self, Read};
use std::str::Utf8Error;

use chrono::{DateTime, Utc};
use tar::{Archive, EntryType};

use crate::error::{Result, ZtocError};
use crate::gzip::Checkpoint;
use crate::peek::Kind;

/// One tar entry: header fields plus its uncompressed-stream offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TOCFile {
    pub name: String,
    pub linkname: Option<String>,
    pub typeflag: EntryType,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub uname: Option<String>,
    pub gname: Option<String>,
    pub mtime: i64,
    pub size: u64,
    pub offset: u64,
    pub xattrs: HashMap<String, String>,
}

impl TOCFile {
    pub fn is_dir(&self) -> bool {
        self.typeflag == EntryType::Directory()
    }

    pub fn is_symlink(&self) -> bool {
        self.typeflag == EntryType::Symlink()
    }

    pub fn mtime_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.mtime, 0)
    }
}

/// Ordered checkpoints plus ordered tar entries, and the metadata needed
/// to reopen the archive: declared kind and span size.
#[derive(Debug, Clone)]
pub struct TOC {
    pub kind: Kind,
    pub span_size: u64,
    pub total_in: u64,
    pub total_out: u64,
    pub checkpoints: Vec<Checkpoint>,
    pub files: Vec<TOCFile>,
    /// Set when this TOC was recovered after a mid-stream error (see
    /// `Indexer::build`): the file list is a valid prefix, not the
    /// whole archive.
    pub incomplete: bool,
}

impl TOC {
    /// The greatest checkpoint whose `out_offset <= offset`, or `None`
    /// if `offset` precedes every checkpoint (extraction then starts
    /// from the beginning of the compressed stream).
    pub fn checkpoint_before(&self, offset: u64) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.out_offset <= offset)
    }
}

fn map_utf8_error(_: Utf8Error) -> ZtocError {
    ZtocError::CorruptStream("invalid UTF-8 in tar header".into())
}

/// Extracts header fields from one tar entry. Public to the crate so
/// the indexer can reuse it while driving its own entry loop (it needs
/// partial results on error, which [`parse_tar_stream`] doesn't expose).
pub(crate) fn entry_to_tocfile<R: Read>(mut entry: tar::Entry<'_, R>) -> Result<TOCFile> {
    let offset = entry.raw_file_position();
    let header = entry.header();
    let typeflag = header.entry_type();
    let mode = header.mode().map_err(ZtocError::Io)?;
    let uid = header.uid().map_err(ZtocError::Io)?;
    let gid = header.gid().map_err(ZtocError::Io)?;
    let mtime = header.mtime().map_err(ZtocError::Io)? as i64;
    let size = entry.size();

    let name = entry
        .path()
        .map_err(ZtocError::Io)?
        .to_string_lossy()
        .into_owned();
    let linkname = entry
        .link_name()
        .map_err(ZtocError::Io)?
        .map(|p| p.to_string_lossy().into_owned());
    let uname = entry
        .header()
        .username()
        .map_err(map_utf8_error)?
        .map(str::to_owned);
    let gname = entry
        .header()
        .groupname()
        .map_err(map_utf8_error)?
        .map(str::to_owned);

    let xattrs = entry
        .pax_extensions()
        .map_err(ZtocError::Io)?
        .map(|exts| {
            exts.map(|ext| {
                ext.map_err(ZtocError::Io).and_then(|ext| {
                    Ok((
                        ext.key().map_err(map_utf8_error)?.to_string(),
                        ext.value().map_err(map_utf8_error)?.to_string(),
                    ))
                })
            })
            .collect::<Result<HashMap<_, _>>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(TOCFile {
        name,
        linkname,
        typeflag,
        mode,
        uid,
        gid,
        uname,
        gname,
        mtime,
        size,
        offset,
        xattrs,
    })
}

/// Drains `reader` (the uncompressed tar byte stream) and returns every
/// non-extension header as a [`TOCFile`], in tar order. Does not read
/// payload bytes directly; the `tar` crate seeks past them internally
/// using the declared size.
pub fn parse_tar_stream<R: Read>(reader: R) -> Result<Vec<TOCFile>> {
    let mut archive = Archive::new(reader);
    archive.set_unpack_xattrs(true);
    archive.set_ignore_zeros(true);

    let mut files = Vec::new();
    for entry in archive.entries().map_err(ZtocError::Io)? {
        let entry = entry.map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => ZtocError::UnexpectedEOF,
            _ => ZtocError::Io(e),
        })?;
        files.push(entry_to_tocfile(entry)?);
    }
    Ok(files)
}
