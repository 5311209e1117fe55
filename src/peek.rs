//! Stream-kind sniffing, ported from the reference `Peek` implementation:
//! look at the first 1 KiB without consuming the reader, and say
//! `tar`, `gzip`, `tar+gzip`, or `unknown`.

use std::io::{self, Read};

const PEEK_LEN: usize = 1024;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAGIC_GNU: &[u8; 6] = b"ustar ";
const VERSION_GNU: &[u8; 2] = b" \0";
const MAGIC_USTAR: &[u8; 6] = b"ustar\0";
const VERSION_USTAR: &[u8; 2] = b"00";

/// Declared or detected kind of a compressed-input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Tar,
    Gzip,
    TarGzip,
    Unknown,
}

impl Kind {
    pub fn mime(&self) -> &'static str {
        match self {
            Kind::Tar => "application/tar",
            Kind::Gzip => "application/gzip",
            Kind::TarGzip => "application/tar+gzip",
            Kind::Unknown => "application/octet-stream",
        }
    }
}

/// Buffers up to `PEEK_LEN` bytes from `r` and reports the detected kind.
/// Never fails on a short read: fewer bytes than needed just means the
/// relevant magic can't match, which falls out as `Kind::Unknown`.
pub fn peek<R: Read>(r: &mut R) -> io::Result<(Kind, Vec<u8>)> {
    let mut buf = Vec::with_capacity(PEEK_LEN);
    let mut chunk = [0u8; PEEK_LEN];
    let mut filled = 0;
    while filled < PEEK_LEN {
        let n = r.read(&mut chunk[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.extend_from_slice(&chunk[..filled]);

    if is_gzip(&buf) {
        // We can't fully decompress here just to sniff; gzip-wrapped
        // tar is confirmed by the indexer once it has a decompressor
        // in hand. At peek time we only assert "gzip", and the caller
        // upgrades to TarGzip once the tar parser reads its first
        // header off the decompressed stream.
        return Ok((Kind::Gzip, buf));
    }
    if is_tar(&buf) {
        return Ok((Kind::Tar, buf));
    }
    Ok((Kind::Unknown, buf))
}

fn is_gzip(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0..2] == GZIP_MAGIC
}

fn is_tar(buf: &[u8]) -> bool {
    if buf.len() < 263 {
        return false;
    }
    let magic = &buf[257..263];
    magic == MAGIC_GNU || magic == MAGIC_USTAR
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn detects_gzip() {
        let data = [0x1f, 0x8bu8, 0x08, 0, 0, 0, 0, 0];
        let (kind, _) = peek(&mut Cursor::new(data)).unwrap();
        assert_eq!(kind, Kind::Gzip);
    }

    #[test]
    fn detects_ustar() {
        let mut block = vec![0u8; 512];
        block[257..263].copy_from_slice(MAGIC_USTAR);
        block[263..265].copy_from_slice(VERSION_USTAR);
        let (kind, _) = peek(&mut Cursor::new(block)).unwrap();
        assert_eq!(kind, Kind::Tar);
    }

    #[test]
    fn detects_gnu_tar() {
        let mut block = vec![0u8; 512];
        block[257..263].copy_from_slice(MAGIC_GNU);
        block[263..265].copy_from_slice(VERSION_GNU);
        let (kind, _) = peek(&mut Cursor::new(block)).unwrap();
        assert_eq!(kind, Kind::Tar);
    }

    #[test]
    fn empty_stream_is_unknown() {
        let (kind, buf) = peek(&mut Cursor::new(Vec::new())).unwrap();
        assert_eq!(kind, Kind::Unknown);
        assert!(buf.is_empty());
    }

    #[test]
    fn random_bytes_are_unknown() {
        let (kind, _) = peek(&mut Cursor::new(vec![1, 2, 3, 4])).unwrap();
        assert_eq!(kind, Kind::Unknown);
    }
}
