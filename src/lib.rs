//! Random access into gzip-compressed tar archives.
//!
//! A compact side index (DEFLATE checkpoints plus a tar table of
//! contents) lets a caller extract any entry from a `tar.gz` without
//! decompressing the whole thing: seek to the nearest checkpoint,
//! resume decompression there, and slice out the entry's bytes. One or
//! more such indexed archives can be layered into a single read-only
//! tree with OCI-style whiteout/opaque-directory semantics.

pub mod document;
pub mod error;
pub mod extract;
pub mod fs;
pub mod gzip;
pub mod indexer;
pub mod peek;
pub mod toc;

pub use error::{Result, ZtocError};
pub use extract::BlobSource;
pub use fs::{DirEntry, MultiFS, SociFS};
pub use gzip::DEFAULT_SPAN_SIZE;
pub use peek::Kind;
pub use toc::{TOCFile, TOC};
