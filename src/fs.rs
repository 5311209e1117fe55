//! A read-only, layered virtual filesystem over one or more indexed
//! tar archives, honoring OCI-style whiteout and opaque-directory
//! semantics. Ported from the reference `SociFS`/`MultiFS` pair:
//! `SociFS` wraps a single layer's [`TOC`] plus its [`BlobSource`];
//! `MultiFS` stacks several `SociFS` layers in construction order
//! (lowest first), which is also the order OCI defines for image
//! layers.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, ZtocError};
use crate::extract::{self, BlobSource};
use crate::toc::{TOCFile, TOC};

const MAX_SYMLINK_HOPS: u32 = 64;

/// Collapses `.`/`..`/repeated slashes the way `path.Clean` does,
/// always returning an absolute, slash-prefixed path.
pub fn clean_path(input: &str) -> String {
    let absolute = if input.starts_with('/') {
        input
    } else {
        return clean_path(&format!("/{input}"));
    };

    let mut stack: Vec<&str> = Vec::new();
    for part in absolute.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

fn strip_link_arrow(name: &str) -> &str {
    // `multiFile`-style display names sometimes carry " -> target"
    // suffixes from a prior listing; only the target is resolvable.
    match name.rsplit_once(" -> ") {
        Some((_, target)) => target,
        None => name,
    }
}

/// A synthesized directory entry: either backed by a real [`TOCFile`]
/// or an implicit directory inferred from a deeper file's path.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub file: Option<TOCFile>,
    pub layer: usize,
    pub whiteout: Option<String>,
    pub overwritten: Option<String>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.file.as_ref().map(|f| f.is_dir()).unwrap_or(true)
    }
}

struct DirContents {
    entries: Vec<DirEntry>,
    real_dirs: HashSet<String>,
    implicit_dirs: HashSet<String>,
    whiteouts: HashMap<String, String>,
}

/// One indexed layer: its [`TOC`] and the blob it was built from.
pub struct SociFS {
    files: Vec<TOCFile>,
    blob: Box<dyn BlobSource>,
    toc: TOC,
    /// Label identifying this layer (e.g. a digest), surfaced on
    /// [`DirEntry::layer`]-adjacent APIs for diagnostics.
    pub label: String,
}

impl SociFS {
    pub fn new(toc: TOC, blob: Box<dyn BlobSource>, label: impl Into<String>) -> Self {
        let files = toc.files.clone();
        Self {
            files,
            blob,
            toc,
            label: label.into(),
        }
    }

    fn find(&self, name: &str) -> Option<&TOCFile> {
        let needle = clean_path(name);
        self.files.iter().find(|f| clean_path(&f.name) == needle)
    }

    /// Follows symlinks (including symlinked ancestor directories) up
    /// to [`MAX_SYMLINK_HOPS`] hops, the way the reference `chase`
    /// does: first try an exact match, then walk ancestor directories
    /// looking for one that is itself a symlink to splice in.
    fn chase(&self, original: &str, gen: u32) -> Result<&TOCFile> {
        if original.is_empty() {
            return Err(ZtocError::NotExist("empty path".into()));
        }
        if gen > MAX_SYMLINK_HOPS {
            return Err(ZtocError::TooManySymlinks(original.to_string()));
        }

        let name = clean_path(original);
        let mut ancestors = vec![parent_of(&name)];
        let mut prev = ancestors[0].clone();
        while prev != "/" && !prev.is_empty() {
            let next = parent_of(&prev);
            if next == prev {
                break;
            }
            ancestors.push(next.clone());
            prev = next;
        }

        for f in &self.files {
            if f.name == original || clean_path(&f.name) == name {
                if f.is_symlink() {
                    let link = f.linkname.clone().unwrap_or_default();
                    return self.chase(&link, gen + 1);
                }
                return Ok(f);
            }
        }

        for f in &self.files {
            if !f.is_symlink() {
                continue;
            }
            for dir in &ancestors {
                if clean_path(&f.name) == *dir {
                    let prefix = clean_path(&f.name);
                    let link = f.linkname.clone().unwrap_or_default();
                    let suffix = name.strip_prefix(&prefix).unwrap_or(&name);
                    let next = format!("{link}{suffix}");
                    return self.chase(&next, gen + 1);
                }
            }
        }

        Err(ZtocError::NotExist(original.to_string()))
    }

    fn dir_entry(&self, layer: usize, dir: &str, fm: Option<&TOCFile>) -> DirEntry {
        let name = match fm {
            Some(fm) => {
                let trimmed = fm.name.trim_start_matches("./");
                let base = trimmed
                    .strip_prefix(&format!("{dir}/"))
                    .unwrap_or(trimmed);
                clean_path(base).trim_start_matches('/').to_string()
            }
            None => dir.to_string(),
        };
        DirEntry {
            name,
            file: fm.cloned(),
            layer,
            whiteout: None,
            overwritten: None,
        }
    }

    fn read_dir_contents(&self, layer: usize, dir: &str) -> DirContents {
        let mut contents = DirContents {
            entries: Vec::new(),
            real_dirs: HashSet::new(),
            implicit_dirs: HashSet::new(),
            whiteouts: HashMap::new(),
        };

        let prefix = clean_path(dir);
        for fm in &self.files {
            let name = clean_path(&fm.name);
            let base = name.rsplit('/').next().unwrap_or("");
            let parent = parent_of(&name);

            if base == ".wh..wh..opq" {
                if prefix.starts_with(&parent) {
                    contents.whiteouts.insert(base.to_string(), name.clone());
                }
            } else if let Some(stripped) = base.strip_prefix(".wh.") {
                if prefix == parent {
                    contents
                        .whiteouts
                        .insert(format!(".wh.{stripped}"), name.clone());
                }
            }

            let under_prefix = prefix == "/" || name == prefix || name.starts_with(&format!("{prefix}/"));
            if !under_prefix {
                continue;
            }

            let rel = name.strip_prefix(&prefix).unwrap_or(&name);
            let rel = rel.strip_prefix('/').unwrap_or(rel);
            if rel.is_empty() {
                continue;
            }
            if let Some((head, _)) = rel.split_once('/') {
                if !head.is_empty() {
                    contents.implicit_dirs.insert(head.to_string());
                }
                continue;
            }

            if fm.is_dir() {
                contents.real_dirs.insert(rel.to_string());
            }
            contents.entries.push(self.dir_entry(layer, dir, Some(fm)));
        }

        contents
    }

    /// Every non-empty regular file across this layer alone.
    pub fn everything(&self) -> Vec<DirEntry> {
        self.files
            .iter()
            .filter(|f| f.size != 0)
            .map(|f| self.dir_entry(0, "", Some(f)))
            .collect()
    }

    pub fn extract(&self, file: &TOCFile) -> Result<Box<dyn std::io::Read>> {
        extract::extract(&self.toc, self.blob.as_ref(), file)
    }
}

/// Stacks layers lowest-first: `layers[0]` is the base image layer and
/// the last entry is the topmost. A name present in more than one
/// layer resolves to the topmost layer's copy, so every lookup here
/// walks the stack in reverse (top to bottom) and returns the first
/// hit, the same "last layer wins" rule the reference `MultiFS` applies
/// by keeping its own layer list top-first and walking it forwards.
pub struct MultiFS {
    layers: Vec<SociFS>,
}

impl MultiFS {
    pub fn new(layers: Vec<SociFS>) -> Self {
        Self { layers }
    }

    fn find(&self, name: &str) -> Option<(&TOCFile, &SociFS)> {
        let needle = clean_path(name);
        for sfs in self.layers.iter().rev() {
            if let Some(fm) = sfs.files.iter().find(|f| clean_path(&f.name) == needle) {
                return Some((fm, sfs));
            }
        }
        None
    }

    fn chase(&self, original: &str, gen: u32) -> Result<(&TOCFile, &SociFS)> {
        if original.is_empty() {
            return Err(ZtocError::NotExist("empty path".into()));
        }
        if gen > MAX_SYMLINK_HOPS {
            return Err(ZtocError::TooManySymlinks(original.to_string()));
        }
        for sfs in self.layers.iter().rev() {
            match sfs.chase(original, gen) {
                Ok(fm) => return Ok((fm, sfs)),
                Err(ZtocError::NotExist(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ZtocError::NotExist(original.to_string()))
    }

    /// Resolves `name` to its [`TOCFile`] and owning layer, stripping
    /// a trailing `" -> target"` display suffix and a leading `/`
    /// first, then falling back to symlink chasing.
    pub fn open(&self, original: &str) -> Result<(TOCFile, &SociFS)> {
        let name = strip_link_arrow(original).trim_start_matches('/');

        if let Some((fm, sfs)) = self.find(name) {
            return Ok((fm.clone(), sfs));
        }

        let base = name.rsplit('/').next().unwrap_or(name);
        if base == "index.html" || base == "favicon.ico" {
            return Err(ZtocError::NotExist(name.to_string()));
        }

        let (fm, sfs) = self.chase(name, 0)?;
        Ok((fm.clone(), sfs))
    }

    pub fn stat(&self, name: &str) -> Result<TOCFile> {
        self.open(name).map(|(fm, _)| fm)
    }

    pub fn extract(&self, name: &str) -> Result<Box<dyn std::io::Read>> {
        let (fm, sfs) = self.open(name)?;
        sfs.extract(&fm)
    }

    /// Lists one directory, applying layered whiteout/opaque masking
    /// and overwrite tagging across all layers.
    ///
    /// Walks layers top to bottom (reverse construction order) so a
    /// whiteout recorded by an upper layer is already known by the
    /// time a lower layer's same-named entry is considered, mirroring
    /// the reference `ReadDir`, which keeps its layer list top-first
    /// and folds each layer's whiteouts into the running set only
    /// after that layer's own entries are resolved against it.
    pub fn read_dir(&self, dir: &str) -> Vec<DirEntry> {
        let subdir = dir.trim_start_matches("./").trim_end_matches('/');

        let mut have: HashMap<String, String> = HashMap::new();
        let mut whiteouts: HashMap<String, String> = HashMap::new();
        let mut implicit_dirs: HashMap<String, usize> = HashMap::new();
        let mut real_dirs: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for (i, sfs) in self.layers.iter().enumerate().rev() {
            let dc = sfs.read_dir_contents(i, subdir);
            for d in &dc.real_dirs {
                real_dirs.insert(d.clone());
            }
            for d in &dc.implicit_dirs {
                implicit_dirs.insert(d.clone(), i);
            }

            for mut entry in dc.entries {
                if entry.name.starts_with(".wh.") {
                    continue;
                }
                entry.layer = i;

                if whiteouts.contains_key(".wh..wh..opq") {
                    continue;
                } else if whiteouts.contains_key(&format!(".wh.{}", entry.name)) {
                    continue;
                } else if let Some(source) = have.get(&entry.name) {
                    if entry.is_dir() {
                        continue;
                    }
                    entry.overwritten = Some(source.clone());
                } else {
                    have.insert(entry.name.clone(), sfs.label.clone());
                }

                out.push(entry);
            }

            for (k, v) in dc.whiteouts {
                whiteouts.entry(k).or_insert(v);
            }
        }

        for (dir, layer) in implicit_dirs {
            if !real_dirs.contains(&dir) {
                out.push(DirEntry {
                    name: dir,
                    file: None,
                    layer,
                    whiteout: None,
                    overwritten: None,
                });
            }
        }

        out
    }

    /// Flattens every layer to the union of non-empty regular files
    /// after masks and overrides are applied, same top-to-bottom walk
    /// as [`MultiFS::read_dir`].
    pub fn everything(&self) -> Vec<DirEntry> {
        let mut have: HashMap<String, String> = HashMap::new();
        let mut whiteouts: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for (i, sfs) in self.layers.iter().enumerate().rev() {
            let mut layer_whiteouts = Vec::new();
            for fm in &sfs.files {
                let name = fm.name.rsplit('/').next().unwrap_or(&fm.name).to_string();
                let dir = parent_of(&clean_path(&fm.name));
                let fullname = clean_path(&fm.name);

                if name.starts_with(".wh.") {
                    layer_whiteouts.push(fullname.clone());
                    continue;
                }

                let opq = format!("{dir}/.wh..wh..opq");
                let wh = format!("{dir}/.wh.{name}");
                if whiteouts.contains(&opq) || whiteouts.contains(&wh) {
                    continue;
                }

                let mut entry = sfs.dir_entry(i, "", Some(fm));
                if let Some(source) = have.get(&fullname) {
                    if entry.is_dir() {
                        continue;
                    }
                    entry.overwritten = Some(source.clone());
                } else {
                    have.insert(fullname.clone(), sfs.label.clone());
                }

                if entry.is_dir() || fm.size == 0 {
                    continue;
                }
                out.push(entry);
            }
            whiteouts.extend(layer_whiteouts);
        }

        out
    }
}

fn parent_of(clean: &str) -> String {
    match clean.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((head, _)) => head.to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::toc::TOC;
    use std::collections::HashMap as Map;

    struct EmptyBlob;
    impl BlobSource for EmptyBlob {
        fn range_read(&self, _off: u64, _end: u64) -> Result<Box<dyn std::io::Read>> {
            Ok(Box::new(std::io::empty()))
        }
    }

    fn file(name: &str, typeflag: tar::EntryType, size: u64, linkname: Option<&str>) -> TOCFile {
        TOCFile {
            name: name.to_string(),
            linkname: linkname.map(str::to_string),
            typeflag,
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            mtime: 0,
            size,
            offset: 0,
            xattrs: Map::new(),
        }
    }

    fn fs_with(files: Vec<TOCFile>, label: &str) -> SociFS {
        let toc = TOC {
            kind: crate::peek::Kind::TarGzip,
            span_size: 0,
            total_in: 0,
            total_out: 0,
            checkpoints: Vec::new(),
            files,
            incomplete: false,
        };
        SociFS::new(toc, Box::new(EmptyBlob), label)
    }

    #[test]
    fn clean_path_collapses_dots() {
        assert_eq!(clean_path("a/./b/../c"), "/a/c");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
    }

    #[test]
    fn symlink_chase_resolves_target() {
        let sfs = fs_with(
            vec![
                file("a/b/c", tar::EntryType::Regular(), 1, None),
                file("link", tar::EntryType::Symlink(), 0, Some("a/b/c")),
            ],
            "layer0",
        );
        let multi = MultiFS::new(vec![sfs]);
        let resolved = multi.stat("link").unwrap();
        assert_eq!(resolved.name, "a/b/c");
    }

    #[test]
    fn symlink_chase_caps_at_64_hops() {
        let sfs = fs_with(vec![file("a", tar::EntryType::Symlink(), 0, Some("a"))], "l");
        let multi = MultiFS::new(vec![sfs]);
        let err = multi.stat("a").unwrap_err();
        assert!(matches!(err, ZtocError::TooManySymlinks(_)));
    }

    #[test]
    fn whiteout_masks_lower_layer_file() {
        let lower = fs_with(
            vec![
                file("dir/keep", tar::EntryType::Regular(), 1, None),
                file("dir/gone", tar::EntryType::Regular(), 1, None),
            ],
            "lower",
        );
        let upper = fs_with(
            vec![
                file("dir/.wh.gone", tar::EntryType::Regular(), 0, None),
                file("dir/new", tar::EntryType::Regular(), 1, None),
            ],
            "upper",
        );
        let multi = MultiFS::new(vec![lower, upper]);
        let mut names: Vec<String> = multi
            .read_dir("dir")
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["keep".to_string(), "new".to_string()]);
    }

    #[test]
    fn opaque_directory_masks_all_lower_entries() {
        let lower = fs_with(vec![file("dir/old", tar::EntryType::Regular(), 1, None)], "lower");
        let upper = fs_with(
            vec![
                file("dir/.wh..wh..opq", tar::EntryType::Regular(), 0, None),
                file("dir/fresh", tar::EntryType::Regular(), 1, None),
            ],
            "upper",
        );
        let multi = MultiFS::new(vec![lower, upper]);
        let names: Vec<String> = multi
            .read_dir("dir")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["fresh".to_string()]);
    }
}
