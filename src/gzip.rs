// This code is based on the Soci Snapshotter zinfo implementation, reworked
// to also support restoring a decompressor from a previously captured
// checkpoint (the `zran.c`-style technique: raw inflate primed with
// `inflatePrime` + `inflateSetDictionary`), which is the other half of what
// a side index needs to be useful.
//
// Portions derived from zlib. See the upstream zlib license below.

/*
  Copyright (C) 1995-2017 Jean-loup Gailly and Mark Adler
  This software is provided 'as-is', without any express or implied
  warranty.  In no event will the authors be held liable for any damages
  arising from the use of this software.
  Permission is granted to anyone to use this software for any purpose,
  including commercial applications, and to alter it and redistribute it
  freely, subject to the following restrictions:
  1. The origin of this software must not be misrepresented; you must not
     claim that you wrote the original software. If you use this software
     in a product, an acknowledgment in the product documentation would be
     appreciated but is not required.
  2. Altered source versions must be plainly marked as such, and must not be
     misrepresented as being the original software.
  3. This notice may not be removed or altered from any source distribution.
  Jean-loup Gailly        Mark Adler
  jloup@gzip.org          madler@alumni.caltech.edu
*/

use std::{
    alloc::{self, Layout},
    cmp,
    ffi::CStr,
    io::{self, Read},
    mem, ptr,
};

use libc::{c_int, c_void};
use libz_sys::{
    inflate, inflateInit2_, inflatePrime, inflateSetDictionary, uInt, z_stream, zlibVersion,
    Z_BLOCK, Z_BUF_ERROR, Z_DATA_ERROR, Z_MEM_ERROR, Z_NEED_DICT, Z_NO_FLUSH, Z_STREAM_END,
    Z_STREAM_ERROR, Z_VERSION_ERROR,
};

use crate::error::{Result, ZtocError};

/// Gzip uses a fixed 32 KiB window.
pub const WINSIZE: usize = 32768;
const CHUNK: usize = 1 << 14;

/// `windowBits` for `inflateInit2_`: positive 47 auto-detects a zlib or
/// gzip wrapper and parses it; negative 15 skips any wrapper and expects
/// a raw DEFLATE bitstream, which is what we resume into from a
/// checkpoint (the gzip header has already been consumed by the time the
/// first checkpoint exists).
const WBITS_GZIP_AUTO: c_int = 47;
const WBITS_RAW: c_int = -15;

/// One serialized DEFLATE resumption point: compressed-stream position,
/// leftover bit count, uncompressed position, and the preceding window.
#[derive(Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub in_offset: u64,
    pub bits: u8,
    pub out_offset: u64,
    pub window: Vec<u8>,
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("in_offset", &self.in_offset)
            .field("out_offset", &self.out_offset)
            .field("bits", &format_args!("0b{:08b}", self.bits))
            .field("window_len", &self.window.len())
            .finish()
    }
}

impl Checkpoint {
    /// Byte offset the compressed source must be positioned to before
    /// feeding bytes into a resumed inflater: one byte earlier than
    /// `in_offset` when there are leftover bits, since those bits live in
    /// the top bits of the byte immediately before `in_offset`.
    pub fn resume_byte_offset(&self) -> u64 {
        if self.bits > 0 {
            self.in_offset.saturating_sub(1)
        } else {
            self.in_offset
        }
    }
}

/// A wrapper around the underlying [`z_stream`].
struct ZStream {
    stream: Box<z_stream>,
}

impl ZStream {
    fn new(window_bits: c_int) -> io::Result<Self> {
        let mut stream = Box::new(z_stream {
            next_in: ptr::null_mut(),
            avail_in: 0,
            total_in: 0,
            next_out: ptr::null_mut(),
            avail_out: 0,
            total_out: 0,
            msg: ptr::null_mut(),
            state: ptr::null_mut(),
            opaque: ptr::null_mut(),
            data_type: 0,
            adler: 0,
            reserved: 0,
            zalloc,
            zfree,
        });
        check_error(
            unsafe {
                inflateInit2_(
                    stream.as_mut() as *mut z_stream,
                    window_bits,
                    zlibVersion(),
                    mem::size_of::<z_stream>() as c_int,
                )
            },
            None,
        )?;

        Ok(Self { stream })
    }

    fn available_in(&self) -> u32 {
        self.stream.avail_in
    }

    fn available_out(&self) -> u32 {
        self.stream.avail_out
    }

    fn data_type(&self) -> i32 {
        self.stream.data_type
    }

    unsafe fn next_in(&mut self, r#in: &mut [u8]) {
        self.stream.avail_in = r#in.len() as u32;
        self.stream.next_in = r#in.as_mut_ptr();
    }

    unsafe fn next_out(&mut self, out: &mut [u8]) {
        self.stream.avail_out = out.len() as u32;
        self.stream.next_out = out.as_mut_ptr();
    }

    fn inflate(&mut self, flush: c_int) -> io::Result<c_int> {
        check_error(
            unsafe { inflate(self.stream.as_mut() as *mut z_stream, flush) },
            Some(&self.stream),
        )
    }

    /// Primes the bit buffer with `bits` unused bits of value `value`,
    /// as captured at checkpoint time. Must be called before the first
    /// `inflate()` on a freshly-initialized raw stream.
    fn prime(&mut self, bits: u8, value: u8) -> io::Result<()> {
        if bits == 0 {
            return Ok(());
        }
        check_error(
            unsafe {
                inflatePrime(
                    self.stream.as_mut() as *mut z_stream,
                    bits as c_int,
                    value as c_int,
                )
            },
            Some(&self.stream),
        )?;
        Ok(())
    }

    /// Loads a preset dictionary (the sliding window at checkpoint time)
    /// so back-references into bytes "before" the resumption point
    /// still resolve correctly.
    fn set_dictionary(&mut self, dict: &[u8]) -> io::Result<()> {
        if dict.is_empty() {
            return Ok(());
        }
        check_error(
            unsafe {
                inflateSetDictionary(
                    self.stream.as_mut() as *mut z_stream,
                    dict.as_ptr(),
                    dict.len() as uInt,
                )
            },
            Some(&self.stream),
        )?;
        Ok(())
    }
}

impl Drop for ZStream {
    fn drop(&mut self) {
        unsafe {
            libz_sys::inflateEnd(self.stream.as_mut() as *mut z_stream);
        }
    }
}

fn check_error(ret: c_int, stream: Option<&z_stream>) -> io::Result<c_int> {
    let msg = stream.and_then(|stream| {
        if !stream.msg.is_null() {
            Some(unsafe { CStr::from_ptr(stream.msg).to_string_lossy().to_string() })
        } else {
            None
        }
    });
    match ret {
        Z_STREAM_ERROR => Err(io::Error::new(
            io::ErrorKind::Other,
            msg.unwrap_or_else(|| "zlib stream error".into()),
        )),
        Z_DATA_ERROR => Err(io::Error::new(
            io::ErrorKind::Other,
            msg.unwrap_or_else(|| "zlib data error".into()),
        )),
        Z_MEM_ERROR => Err(io::Error::new(
            io::ErrorKind::Other,
            msg.unwrap_or_else(|| "zlib mem error".into()),
        )),
        Z_BUF_ERROR => Err(io::Error::new(
            io::ErrorKind::Other,
            msg.unwrap_or_else(|| "zlib buf error".into()),
        )),
        Z_VERSION_ERROR => Err(io::Error::new(
            io::ErrorKind::Other,
            msg.unwrap_or_else(|| "zlib version error".into()),
        )),
        ret if ret < 0 => Err(io::Error::new(
            io::ErrorKind::Other,
            msg.unwrap_or_else(|| "zlib unknown error".into()),
        )),
        ret => Ok(ret),
    }
}

/// Default span size between checkpoints: 4 MiB of compressed input.
pub const DEFAULT_SPAN_SIZE: u64 = 4 << 20;

/// Checkpoints and running totals captured by a [`CheckpointingReader`],
/// shared with its owner through an [`Rc`] so they can be inspected
/// (e.g. for a partial TOC after a mid-stream error) without requiring
/// the reader back from whatever consumed it, in particular from
/// inside a `tar::Archive`, which holds the reader by value while its
/// `Entries` iterator borrows the archive.
#[derive(Default)]
pub struct CheckpointLog {
    pub checkpoints: Vec<Checkpoint>,
    pub total_in: u64,
    pub total_out: u64,
}

/// Streaming gzip decompressor used while indexing: produces uncompressed
/// bytes via [`Read`] and, at span-aligned DEFLATE block boundaries,
/// records a [`Checkpoint`].
pub struct CheckpointingReader<R> {
    reader: R,
    stream: ZStream,

    span_size: u64,
    last_checkpoint_out: u64,
    log: std::rc::Rc<std::cell::RefCell<CheckpointLog>>,

    window: RingBuffer,
    input: [u8; CHUNK],
}

impl<R> CheckpointingReader<R>
where
    R: Read,
{
    /// Returns the reader alongside a handle to its (initially empty)
    /// checkpoint log, which fills in as `read()` is driven forward.
    pub fn new(
        reader: R,
        span_size: u64,
    ) -> io::Result<(Self, std::rc::Rc<std::cell::RefCell<CheckpointLog>>)> {
        let log = std::rc::Rc::new(std::cell::RefCell::new(CheckpointLog::default()));
        let this = Self {
            reader,
            stream: ZStream::new(WBITS_GZIP_AUTO)?,
            span_size,
            last_checkpoint_out: 0,
            log: log.clone(),
            window: RingBuffer::new(),
            input: [0u8; CHUNK],
        };
        Ok((this, log))
    }
}

impl<R> Read for CheckpointingReader<R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        unsafe {
            self.stream.next_out(buf);
        }
        let mut read = 0;
        let mut log = self.log.borrow_mut();

        while self.stream.available_out() > 0 {
            if self.stream.available_in() == 0 {
                let count = self.reader.read(&mut self.input)?;
                if count == 0 {
                    // Upstream ended without a final block; let the
                    // caller see EOF via a short read rather than loop.
                    break;
                }
                unsafe {
                    self.stream.next_in(&mut self.input[..count]);
                }
            }

            let last_read = read;
            log.total_in += self.stream.available_in() as u64;
            log.total_out += self.stream.available_out() as u64;
            read += self.stream.available_out() as usize;
            let status = self.stream.inflate(Z_BLOCK)?;
            log.total_in -= self.stream.available_in() as u64;
            log.total_out -= self.stream.available_out() as u64;
            read -= self.stream.available_out() as usize;

            if status == Z_NEED_DICT {
                return Err(io::Error::new(io::ErrorKind::Other, "unexpected need dict"));
            }

            self.window
                .write(&buf[last_read..buf.len() - self.stream.available_out() as usize]);

            if status == Z_STREAM_END {
                return Ok(read);
            }

            let data_type = self.stream.data_type();
            let at_block_boundary = (data_type & 128) != 0 && (data_type & 64) == 0;
            let crossed_span =
                log.total_out == 0 || log.total_out - self.last_checkpoint_out > self.span_size;
            if at_block_boundary && crossed_span {
                let out_offset = log.total_out;
                let in_offset = log.total_in;
                log.checkpoints.push(Checkpoint {
                    in_offset,
                    bits: (data_type as u8) & 7,
                    out_offset,
                    window: self.window.snapshot(out_offset),
                });
                self.last_checkpoint_out = out_offset;
                tracing::trace!(in_offset, out_offset, "checkpoint captured");
            }
        }

        Ok(read)
    }
}

/// A decompressor resumed from a [`Checkpoint`]. The caller must have
/// positioned `reader` so the first byte it yields is
/// [`Checkpoint::resume_byte_offset`].
pub struct ResumedReader<R> {
    reader: R,
    stream: ZStream,
    input: [u8; CHUNK],
}

impl<R> ResumedReader<R>
where
    R: Read,
{
    pub fn new(checkpoint: &Checkpoint, mut reader: R) -> Result<Self> {
        let mut stream = ZStream::new(WBITS_RAW)?;

        if checkpoint.bits > 0 {
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    ZtocError::UnexpectedEOF
                } else {
                    ZtocError::Io(e)
                }
            })?;
            let value = byte[0] >> (8 - checkpoint.bits);
            stream.prime(checkpoint.bits, value)?;
        }

        let dict_len = cmp::min(checkpoint.out_offset, WINSIZE as u64) as usize;
        let start = checkpoint.window.len().saturating_sub(dict_len);
        stream.set_dictionary(&checkpoint.window[start..])?;

        tracing::debug!(
            in_offset = checkpoint.in_offset,
            out_offset = checkpoint.out_offset,
            "resumed inflater from checkpoint"
        );

        Ok(Self {
            reader,
            stream,
            input: [0u8; CHUNK],
        })
    }
}

impl<R> Read for ResumedReader<R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        unsafe {
            self.stream.next_out(buf);
        }
        let mut read = 0;

        while self.stream.available_out() > 0 {
            if self.stream.available_in() == 0 {
                let count = self.reader.read(&mut self.input)?;
                if count == 0 {
                    break;
                }
                unsafe {
                    self.stream.next_in(&mut self.input[..count]);
                }
            }

            read += self.stream.available_out() as usize;
            let status = self.stream.inflate(Z_NO_FLUSH)?;
            read -= self.stream.available_out() as usize;

            if status == Z_NEED_DICT {
                return Err(io::Error::new(io::ErrorKind::Other, "unexpected need dict"));
            }
            if status == Z_STREAM_END {
                return Ok(read);
            }
        }

        Ok(read)
    }
}

/// A fixed-capacity ring buffer holding the trailing `WINSIZE` bytes of
/// uncompressed output produced so far.
struct RingBuffer {
    buffer: Box<[u8; WINSIZE]>,
    index: usize,
}

impl RingBuffer {
    fn new() -> Self {
        Self {
            buffer: Box::new([0u8; WINSIZE]),
            index: 0,
        }
    }

    fn write(&mut self, mut buf: &[u8]) {
        if buf.is_empty() {
            return;
        }

        if buf.len() > self.buffer.len() {
            buf = &buf[buf.len() - self.buffer.len()..];
        }

        while !buf.is_empty() {
            let size = cmp::min(buf.len(), self.buffer.len() - self.index);
            self.buffer[self.index..self.index + size].copy_from_slice(&buf[..size]);
            buf = &buf[size..];
            self.index = (self.index + size) % self.buffer.len();
        }
    }

    /// Contents in chronological (oldest-first) order, as two possibly
    /// non-contiguous slices.
    fn read(&self) -> (&[u8], &[u8]) {
        (&self.buffer[self.index..], &self.buffer[..self.index])
    }

    /// A `WINSIZE`-length owned copy, suitable for storing in a
    /// [`Checkpoint`]. `out_offset` is used only to decide, at restore
    /// time, how much of this window is meaningful (see
    /// [`ResumedReader::new`]); the stored window is always full-length
    /// and zero-padded at the front when fewer than `WINSIZE` bytes have
    /// been produced yet.
    fn snapshot(&self, _out_offset: u64) -> Vec<u8> {
        let (left, right) = self.read();
        let mut out = Vec::with_capacity(WINSIZE);
        out.extend_from_slice(left);
        out.extend_from_slice(right);
        out
    }
}

const ALIGN: usize = std::mem::align_of::<usize>();
type AllocSize = uInt;

fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

extern "C" fn zalloc(_ptr: *mut c_void, items: AllocSize, item_size: AllocSize) -> *mut c_void {
    let size = match items
        .checked_mul(item_size)
        .and_then(|i| usize::try_from(i).ok())
        .map(|size| align_up(size, ALIGN))
        .and_then(|i| i.checked_add(std::mem::size_of::<usize>()))
    {
        Some(i) => i,
        None => return ptr::null_mut(),
    };

    let layout = match Layout::from_size_align(size, ALIGN) {
        Ok(layout) => layout,
        Err(_) => return ptr::null_mut(),
    };

    unsafe {
        let ptr = alloc::alloc(layout) as *mut usize;
        if ptr.is_null() {
            return ptr as *mut c_void;
        }
        *ptr = size;
        ptr.add(1) as *mut c_void
    }
}

extern "C" fn zfree(_ptr: *mut c_void, address: *mut c_void) {
    unsafe {
        let ptr = (address as *mut usize).offset(-1);
        let size = *ptr;
        let layout = Layout::from_size_align_unchecked(size, ALIGN);
        alloc::dealloc(ptr as *mut u8, layout)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    fn gzip_of(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn ring_buffer_wraps() {
        let mut buffer = RingBuffer::new();
        assert_eq!(buffer.read().0.iter().all(|&b| b == 0), true);

        buffer.write(&[1u8; 50]);
        let (_left, right) = buffer.read();
        assert_eq!(&right[..50], &[1u8; 50][..]);
    }

    #[test]
    fn decompresses_and_checkpoints() {
        let original = vec![b'x'; 200_000];
        let gz = gzip_of(&original);
        let (mut reader, log) = CheckpointingReader::new(Cursor::new(gz), 4096).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, original);
        assert!(log.borrow().total_out as usize == original.len());
        let checkpoints = log.borrow().checkpoints.clone();
        assert!(!checkpoints.is_empty());
        for w in checkpoints.windows(2) {
            assert!(w[0].in_offset < w[1].in_offset);
            assert!(w[0].out_offset < w[1].out_offset);
        }
    }

    #[test]
    fn restores_and_matches_reference() {
        let mut original = Vec::new();
        for i in 0..300_000u32 {
            original.push((i % 251) as u8);
        }
        let gz = gzip_of(&original);

        let (mut reader, log) = CheckpointingReader::new(Cursor::new(gz.clone()), 4096).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, original);
        let checkpoints = log.borrow().checkpoints.clone();
        assert!(checkpoints.len() >= 2);

        let cp = &checkpoints[checkpoints.len() / 2];
        let start = cp.resume_byte_offset() as usize;
        let mut resumed = ResumedReader::new(cp, Cursor::new(&gz[start..])).unwrap();
        let mut tail = Vec::new();
        resumed.read_to_end(&mut tail).unwrap();

        assert_eq!(tail, original[cp.out_offset as usize..]);
    }
}
