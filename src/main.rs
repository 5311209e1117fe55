use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ztoc::{
    document,
    extract::{self, BlobSource},
    indexer,
    toc::TOC,
};

#[derive(Parser)]
#[command(name = "ztoc", version, about = "Random access into gzip-compressed tar archives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an index for a tar.gz (stdin or file) and write it to stdout.
    Index {
        input: Option<PathBuf>,
        /// Target compressed-byte distance between checkpoints.
        #[arg(long, default_value_t = ztoc::DEFAULT_SPAN_SIZE)]
        span_size: u64,
    },
    /// Print a UNIX-style long listing of a tar.gz's files, via its index.
    Ls { input: PathBuf },
    /// Write one entry's content to stdout.
    Cat {
        name: String,
        blob: PathBuf,
        index: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Index { input, span_size } => cmd_index(input, span_size),
        Commands::Ls { input } => cmd_ls(input),
        Commands::Cat { name, blob, index } => cmd_cat(name, blob, index),
    }
}

fn cmd_index(input: Option<PathBuf>, span_size: u64) -> Result<(), Box<dyn std::error::Error>> {
    let toc = match input {
        Some(path) => indexer::build_index(File::open(path)?, span_size, None)?,
        None => indexer::build_index(io::stdin().lock(), span_size, None)?,
    };
    if toc.incomplete {
        tracing::warn!("index is incomplete: input ended before the tar stream terminated");
    }
    document::write_index(&toc, io::stdout().lock())?;
    Ok(())
}

fn cmd_ls(input: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let toc = indexer::build_index(File::open(input)?, ztoc::DEFAULT_SPAN_SIZE, None)?;
    for f in &toc.files {
        let kind = if f.is_dir() {
            'd'
        } else if f.is_symlink() {
            'l'
        } else {
            '-'
        };
        println!(
            "{kind}{:o} {:>8} {:>8} {:>12} {}",
            f.mode,
            f.uname.as_deref().unwrap_or(&f.uid.to_string()),
            f.gname.as_deref().unwrap_or(&f.gid.to_string()),
            f.size,
            f.name,
        );
    }
    Ok(())
}

fn cmd_cat(
    name: String,
    blob: PathBuf,
    index: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let toc: TOC = document::read_index(File::open(index)?)?;
    let file = toc
        .files
        .iter()
        .find(|f| f.name == name || f.name.trim_start_matches("./") == name)
        .ok_or_else(|| ztoc::ZtocError::NotExist(name.clone()))?;

    let source = FileBlobSource { path: blob };
    let mut reader = extract::extract(&toc, &source, file)?;
    io::copy(&mut reader, &mut io::stdout().lock())?;
    Ok(())
}

/// A local-file [`BlobSource`]: each `range_read` opens its own handle
/// so concurrent extractions never contend on a shared file position.
struct FileBlobSource {
    path: PathBuf,
}

impl BlobSource for FileBlobSource {
    fn range_read(&self, off: u64, end: u64) -> ztoc::Result<Box<dyn Read>> {
        let mut file = File::open(&self.path).map_err(ztoc::ZtocError::Io)?;
        file.seek(SeekFrom::Start(off)).map_err(ztoc::ZtocError::Io)?;
        if end == extract::TO_END {
            Ok(Box::new(file))
        } else {
            Ok(Box::new(file.take(end - off)))
        }
    }
}
