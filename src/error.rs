//! Error taxonomy shared by the indexer, extractor, and layered filesystem.

use thiserror::Error;

/// All fallible core operations return this. Mirrors the error kinds a
/// consumer of the index needs to branch on, rather than a generic
/// catch-all `anyhow`-style wrapper.
#[derive(Error, Debug)]
pub enum ZtocError {
    #[error("unexpected end of stream")]
    UnexpectedEOF,

    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error("file does not exist: {0}")]
    NotExist(String),

    #[error("too many symlinks resolving {0}")]
    TooManySymlinks(String),

    #[error("unsupported stream kind")]
    UnsupportedKind,

    #[error("invalid index: {0}")]
    InvalidIndex(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ZtocError>;

impl ZtocError {
    /// `true` for the two kinds the symlink chaser and peek logic
    /// locally recover from, per the error propagation rules.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, ZtocError::NotExist(_))
    }
}
