use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, Header};
use tempfile::NamedTempFile;

use ztoc::extract::{BlobSource, TO_END};
use ztoc::{document, extract, fs::SociFS, indexer, MultiFS};

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

struct FileBlob {
    path: std::path::PathBuf,
}

impl BlobSource for FileBlob {
    fn range_read(&self, off: u64, end: u64) -> ztoc::Result<Box<dyn Read>> {
        let mut file = File::open(&self.path).map_err(ztoc::ZtocError::Io)?;
        file.seek(SeekFrom::Start(off)).map_err(ztoc::ZtocError::Io)?;
        if end == TO_END {
            Ok(Box::new(file))
        } else {
            Ok(Box::new(file.take(end - off)))
        }
    }
}

#[test]
fn indexes_and_extracts_through_real_files() {
    let tar_bytes = build_tar(&[("hello.txt", b"hello world"), ("dir/nested", b"x")]);
    let gz = gzip_of(&tar_bytes);

    let blob_file = NamedTempFile::new().unwrap();
    std::fs::write(blob_file.path(), &gz).unwrap();

    let toc = indexer::build_index(File::open(blob_file.path()).unwrap(), 4096, None).unwrap();
    assert_eq!(toc.files.len(), 2);

    let index_file = NamedTempFile::new().unwrap();
    document::write_index(&toc, File::create(index_file.path()).unwrap()).unwrap();

    let reloaded = document::read_index(File::open(index_file.path()).unwrap()).unwrap();
    assert_eq!(reloaded.files.len(), toc.files.len());

    let blob = FileBlob {
        path: blob_file.path().to_path_buf(),
    };
    let entry = reloaded.files.iter().find(|f| f.name == "hello.txt").unwrap();
    let mut out = Vec::new();
    extract::extract(&reloaded, &blob, entry)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(out, b"hello world");
}

#[test]
fn layered_fs_applies_whiteouts_across_real_archives() {
    let lower_tar = build_tar(&[("dir/keep", b"1"), ("dir/gone", b"2")]);
    let upper_tar = build_tar(&[("dir/.wh.gone", b""), ("dir/new", b"3")]);

    let lower_blob = NamedTempFile::new().unwrap();
    std::fs::write(lower_blob.path(), gzip_of(&lower_tar)).unwrap();
    let upper_blob = NamedTempFile::new().unwrap();
    std::fs::write(upper_blob.path(), gzip_of(&upper_tar)).unwrap();

    let lower_toc = indexer::build_index(File::open(lower_blob.path()).unwrap(), 4096, None).unwrap();
    let upper_toc = indexer::build_index(File::open(upper_blob.path()).unwrap(), 4096, None).unwrap();

    let lower_fs = SociFS::new(
        lower_toc,
        Box::new(FileBlob {
            path: lower_blob.path().to_path_buf(),
        }),
        "lower",
    );
    let upper_fs = SociFS::new(
        upper_toc,
        Box::new(FileBlob {
            path: upper_blob.path().to_path_buf(),
        }),
        "upper",
    );

    let multi = MultiFS::new(vec![lower_fs, upper_fs]);
    let mut names: Vec<String> = multi.read_dir("dir").into_iter().map(|e| e.name).collect();
    names.sort();
    assert_eq!(names, vec!["keep".to_string(), "new".to_string()]);

    let mut out = Vec::new();
    multi.extract("dir/new").unwrap().read_to_end(&mut out).unwrap();
    assert_eq!(out, b"3");
}
