//! Self-describing serialized index envelope: magic + format version +
//! a `serde`/`bincode`-encoded body + a CRC32 trailer.
//!
//! The reference implementation this crate descends from serialized this
//! with a generated FlatBuffers schema; that schema and the `flatc`
//! compiler it depends on are not available in this build, so the body
//! is encoded with `serde` + `bincode` instead (see DESIGN.md). The
//! envelope shape (magic, version, checksum) follows the `.6cy`
//! container format's superblock.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ZtocError};
use crate::gzip::Checkpoint;
use crate::peek::Kind;
use crate::toc::{TOCFile, TOC};

const MAGIC: &[u8; 4] = b"ZTC1";
const FORMAT_VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    in_offset: u64,
    bits: u8,
    out_offset: u64,
    window: Vec<u8>,
}

impl From<&Checkpoint> for CheckpointRecord {
    fn from(c: &Checkpoint) -> Self {
        Self {
            in_offset: c.in_offset,
            bits: c.bits,
            out_offset: c.out_offset,
            window: c.window.clone(),
        }
    }
}

impl From<CheckpointRecord> for Checkpoint {
    fn from(r: CheckpointRecord) -> Self {
        Checkpoint {
            in_offset: r.in_offset,
            bits: r.bits,
            out_offset: r.out_offset,
            window: r.window,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    name: String,
    linkname: Option<String>,
    typeflag: u8,
    mode: u32,
    uid: u64,
    gid: u64,
    uname: Option<String>,
    gname: Option<String>,
    mtime: i64,
    size: u64,
    offset: u64,
    xattrs: Vec<(String, String)>,
}

impl From<&TOCFile> for FileRecord {
    fn from(f: &TOCFile) -> Self {
        Self {
            name: f.name.clone(),
            linkname: f.linkname.clone(),
            typeflag: f.typeflag.as_byte(),
            mode: f.mode,
            uid: f.uid,
            gid: f.gid,
            uname: f.uname.clone(),
            gname: f.gname.clone(),
            mtime: f.mtime,
            size: f.size,
            offset: f.offset,
            xattrs: f.xattrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

impl From<FileRecord> for TOCFile {
    fn from(r: FileRecord) -> Self {
        TOCFile {
            name: r.name,
            linkname: r.linkname,
            typeflag: tar::EntryType::new(r.typeflag),
            mode: r.mode,
            uid: r.uid,
            gid: r.gid,
            uname: r.uname,
            gname: r.gname,
            mtime: r.mtime,
            size: r.size,
            offset: r.offset,
            xattrs: r.xattrs.into_iter().collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Body {
    kind: u8,
    span_size: u64,
    total_in: u64,
    total_out: u64,
    incomplete: bool,
    checkpoints: Vec<CheckpointRecord>,
    files: Vec<FileRecord>,
}

fn kind_to_byte(kind: Kind) -> u8 {
    match kind {
        Kind::Tar => 0,
        Kind::Gzip => 1,
        Kind::TarGzip => 2,
        Kind::Unknown => 255,
    }
}

fn byte_to_kind(b: u8) -> Result<Kind> {
    match b {
        0 => Ok(Kind::Tar),
        1 => Ok(Kind::Gzip),
        2 => Ok(Kind::TarGzip),
        _ => Err(ZtocError::InvalidIndex("unrecognized kind byte".into())),
    }
}

/// Serializes a [`TOC`] as the self-describing envelope described above
/// and writes it to `sink`.
pub fn write_index<W: Write>(toc: &TOC, mut sink: W) -> Result<()> {
    let body = Body {
        kind: kind_to_byte(toc.kind),
        span_size: toc.span_size,
        total_in: toc.total_in,
        total_out: toc.total_out,
        incomplete: toc.incomplete,
        checkpoints: toc.checkpoints.iter().map(CheckpointRecord::from).collect(),
        files: toc.files.iter().map(FileRecord::from).collect(),
    };
    let body_bytes =
        bincode::serialize(&body).map_err(|e| ZtocError::InvalidIndex(e.to_string()))?;

    let mut envelope = Vec::with_capacity(4 + 2 + body_bytes.len() + 4);
    envelope.extend_from_slice(MAGIC);
    envelope.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    envelope.extend_from_slice(&body_bytes);

    let checksum = crc32fast::hash(&envelope);
    envelope.extend_from_slice(&checksum.to_le_bytes());

    sink.write_all(&envelope).map_err(ZtocError::Io)
}

/// Parses a previously-written index document from `reader`.
pub fn read_index<R: Read>(mut reader: R) -> Result<TOC> {
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .map_err(ZtocError::Io)?;

    if buf.len() < 4 + 2 + 4 {
        return Err(ZtocError::InvalidIndex("index document truncated".into()));
    }

    let (head, checksum_bytes) = buf.split_at(buf.len() - 4);
    let stored_checksum = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
    if crc32fast::hash(head) != stored_checksum {
        return Err(ZtocError::InvalidIndex("index checksum mismatch".into()));
    }

    let (magic, rest) = head.split_at(4);
    if magic != MAGIC {
        return Err(ZtocError::InvalidIndex("bad index magic".into()));
    }
    let (version_bytes, body_bytes) = rest.split_at(2);
    let version = u16::from_le_bytes(version_bytes.try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(ZtocError::InvalidIndex(format!(
            "unsupported index format version {version}"
        )));
    }

    let body: Body =
        bincode::deserialize(body_bytes).map_err(|e| ZtocError::InvalidIndex(e.to_string()))?;

    Ok(TOC {
        kind: byte_to_kind(body.kind)?,
        span_size: body.span_size,
        total_in: body.total_in,
        total_out: body.total_out,
        incomplete: body.incomplete,
        checkpoints: body.checkpoints.into_iter().map(Checkpoint::from).collect(),
        files: body.files.into_iter().map(TOCFile::from).collect(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peek::Kind;
    use std::collections::HashMap;

    fn sample_toc() -> TOC {
        TOC {
            kind: Kind::TarGzip,
            span_size: 4 << 20,
            total_in: 100,
            total_out: 500,
            incomplete: false,
            checkpoints: vec![Checkpoint {
                in_offset: 10,
                bits: 3,
                out_offset: 0,
                window: vec![0u8; 32768],
            }],
            files: vec![TOCFile {
                name: "hello.txt".into(),
                linkname: None,
                typeflag: tar::EntryType::Regular(),
                mode: 0o644,
                uid: 0,
                gid: 0,
                uname: Some("root".into()),
                gname: Some("root".into()),
                mtime: 12345,
                size: 11,
                offset: 512,
                xattrs: HashMap::new(),
            }],
        }
    }

    #[test]
    fn round_trips() {
        let toc = sample_toc();
        let mut buf = Vec::new();
        write_index(&toc, &mut buf).unwrap();
        let parsed = read_index(&buf[..]).unwrap();

        assert_eq!(parsed.kind, toc.kind);
        assert_eq!(parsed.span_size, toc.span_size);
        assert_eq!(parsed.checkpoints.len(), toc.checkpoints.len());
        assert_eq!(parsed.checkpoints[0].in_offset, toc.checkpoints[0].in_offset);
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].name, "hello.txt");
    }

    #[test]
    fn rejects_truncated_document() {
        let toc = sample_toc();
        let mut buf = Vec::new();
        write_index(&toc, &mut buf).unwrap();
        buf.truncate(buf.len() - 10);
        assert!(read_index(&buf[..]).is_err());
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let toc = sample_toc();
        let mut buf = Vec::new();
        write_index(&toc, &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(read_index(&buf[..]).is_err());
    }
}
