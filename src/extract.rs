//! Maps a located [`TOCFile`] to a byte stream: pick the nearest
//! preceding checkpoint, restore the gzip engine there over a
//! random-access byte source, discard the bytes before the entry's
//! payload, and yield exactly `size` bytes.

use std::io::{self, Read};

use crate::error::{Result, ZtocError};
use crate::gzip::ResumedReader;
use crate::peek::Kind;
use crate::toc::{TOCFile, TOC};

/// A random-access byte-range reader over the original compressed (or
/// plain tar) blob. `end == TO_END` means "read until the source is
/// exhausted"; implementations over a fixed-size blob may treat any
/// `end` at or beyond the blob's length the same way.
pub trait BlobSource {
    fn range_read(&self, off: u64, end: u64) -> Result<Box<dyn Read>>;
}

pub const TO_END: u64 = u64::MAX;

/// Produces exactly `file.size` uncompressed bytes for `file`, reading
/// compressed bytes from `blob` as needed.
pub fn extract(toc: &TOC, blob: &dyn BlobSource, file: &TOCFile) -> Result<Box<dyn Read>> {
    if file.size == 0 {
        return Ok(Box::new(io::empty()));
    }

    if toc.kind == Kind::Tar {
        let src = blob.range_read(file.offset, file.offset + file.size)?;
        return Ok(Box::new(src.take(file.size)));
    }

    let checkpoint = toc
        .checkpoint_before(file.offset)
        .ok_or_else(|| ZtocError::InvalidIndex("no checkpoint covers this offset".into()))?;

    let compressed = blob.range_read(checkpoint.resume_byte_offset(), TO_END)?;
    let mut resumed = ResumedReader::new(checkpoint, compressed)?;

    let mut discard = file.offset - checkpoint.out_offset;
    let mut sink = [0u8; 8192];
    while discard > 0 {
        let want = discard.min(sink.len() as u64) as usize;
        let n = resumed.read(&mut sink[..want]).map_err(ZtocError::Io)?;
        if n == 0 {
            return Err(ZtocError::UnexpectedEOF);
        }
        discard -= n as u64;
    }

    Ok(Box::new(resumed.take(file.size)))
}
