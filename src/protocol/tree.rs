//! Merkle input tree assembly.
//!
//! Files are registered by tree-relative path; `build_tree` walks the accumulated entries
//! bottom-up, children in name order, so the root digest depends only on the set of
//! (path, content, executable) entries and never on insertion order.

use crate::error::FileTreeError;
use crate::protocol::{
    Digest, DirectoryNode, FileNode, Protocol, SymlinkNode, UploadDataSupplier,
};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct InputFile {
    pub digest: Digest,
    pub is_executable: bool,
    data: UploadDataSupplier,
}

impl InputFile {
    pub fn new(digest: Digest, is_executable: bool, data: UploadDataSupplier) -> Self {
        Self {
            digest,
            is_executable,
            data,
        }
    }

    pub fn from_bytes(protocol: &Protocol, data: impl Into<Vec<u8>>, is_executable: bool) -> Self {
        let data = data.into();
        let digest = protocol.compute_digest(&data);
        Self::new(digest, is_executable, UploadDataSupplier::from_bytes(data))
    }

    /// Hashes the file now; the content is re-read from disk whenever it is uploaded.
    pub fn from_path(
        protocol: &Protocol,
        path: impl Into<PathBuf>,
        is_executable: bool,
    ) -> std::io::Result<Self> {
        let path = path.into();
        let data = std::fs::read(&path)?;
        let digest = protocol.compute_digest(&data);
        Ok(Self::new(
            digest,
            is_executable,
            UploadDataSupplier::from_path(path),
        ))
    }

    /// Like [`from_path`](Self::from_path), taking the executable bit from the file's mode.
    pub fn from_local_file(protocol: &Protocol, path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let is_executable = is_executable(&std::fs::metadata(&path)?);
        Self::from_path(protocol, path, is_executable)
    }

    pub fn size(&self) -> u64 {
        self.digest.size_bytes
    }

    pub fn data(&self) -> &UploadDataSupplier {
        &self.data
    }
}

#[derive(Debug, Clone)]
enum TreeEntry {
    File(InputFile),
    Symlink(String),
    Directory(DirectoryBuilder),
}

impl TreeEntry {
    fn kind(&self) -> &'static str {
        match self {
            TreeEntry::File(_) => "file",
            TreeEntry::Symlink(_) => "symlink",
            TreeEntry::Directory(_) => "directory",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DirectoryBuilder {
    children: BTreeMap<String, TreeEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct FileTreeBuilder {
    root: DirectoryBuilder,
    file_count: usize,
    file_bytes: u64,
}

impl FileTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl AsRef<Path>, file: InputFile) -> Result<(), FileTreeError> {
        let size = file.size();
        if self.insert(path.as_ref(), TreeEntry::File(file))? {
            self.file_count += 1;
            self.file_bytes += size;
        }
        Ok(())
    }

    pub fn add_symlink(
        &mut self,
        path: impl AsRef<Path>,
        target: impl Into<String>,
    ) -> Result<(), FileTreeError> {
        self.insert(path.as_ref(), TreeEntry::Symlink(target.into()))?;
        Ok(())
    }

    /// Number of distinct files registered
    pub fn file_count(&self) -> usize {
        self.file_count
    }

    /// Sum of the sizes of all registered files
    pub fn file_bytes(&self) -> u64 {
        self.file_bytes
    }

    /// Returns `Ok(true)` when a new entry was inserted, `Ok(false)` for an identical re-add.
    fn insert(&mut self, path: &Path, entry: TreeEntry) -> Result<bool, FileTreeError> {
        let names = split_path(path)?;
        let Some((leaf, parents)) = names.split_last() else {
            return Err(FileTreeError::InvalidPath(path.to_path_buf()));
        };

        let mut dir = &mut self.root;
        for (depth, name) in parents.iter().enumerate() {
            let child = dir
                .children
                .entry(name.clone())
                .or_insert_with(|| TreeEntry::Directory(DirectoryBuilder::default()));
            dir = match child {
                TreeEntry::Directory(d) => d,
                other => {
                    let prefix: PathBuf = parents[..=depth].iter().collect();
                    return Err(FileTreeError::PathConflict {
                        path: path.to_path_buf(),
                        reason: format!("{} is a {}, not a directory", prefix.display(), other.kind()),
                    });
                }
            };
        }

        match dir.children.get(leaf) {
            None => {
                dir.children.insert(leaf.clone(), entry);
                Ok(true)
            }
            Some(existing) => match (existing, &entry) {
                (TreeEntry::File(a), TreeEntry::File(b))
                    if a.digest == b.digest && a.is_executable == b.is_executable =>
                {
                    Ok(false)
                }
                (TreeEntry::Symlink(a), TreeEntry::Symlink(b)) if a == b => Ok(false),
                (existing, entry) => Err(FileTreeError::PathConflict {
                    path: path.to_path_buf(),
                    reason: format!(
                        "cannot add {} where a {} already exists",
                        entry.kind(),
                        existing.kind()
                    ),
                }),
            },
        }
    }

    /// Builds the merkle tree and hands every file and directory blob to `sink`.
    ///
    /// Returns the root directory digest.
    pub fn build_tree<F>(&self, protocol: &Protocol, mut sink: F) -> Result<Digest, FileTreeError>
    where
        F: FnMut(Digest, UploadDataSupplier),
    {
        build_directory(&self.root, protocol, &mut sink)
    }
}

fn build_directory<F>(
    dir: &DirectoryBuilder,
    protocol: &Protocol,
    sink: &mut F,
) -> Result<Digest, FileTreeError>
where
    F: FnMut(Digest, UploadDataSupplier),
{
    let mut files = Vec::new();
    let mut directories = Vec::new();
    let mut symlinks = Vec::new();

    for (name, entry) in &dir.children {
        match entry {
            TreeEntry::File(file) => {
                sink(file.digest.clone(), file.data.clone());
                files.push(FileNode {
                    name: name.clone(),
                    digest: file.digest.clone(),
                    is_executable: file.is_executable,
                });
            }
            TreeEntry::Symlink(target) => symlinks.push(SymlinkNode {
                name: name.clone(),
                target: target.clone(),
            }),
            TreeEntry::Directory(child) => {
                let digest = build_directory(child, protocol, sink)?;
                directories.push(DirectoryNode {
                    name: name.clone(),
                    digest,
                });
            }
        }
    }

    let directory = protocol.new_directory(files, directories, symlinks);
    let (digest, data) = protocol.digest_message(&directory)?;
    sink(digest.clone(), UploadDataSupplier::from_bytes(data));
    Ok(digest)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Splits a tree-relative path into its names. Absolute paths, `..` and non-UTF-8 names are
/// rejected.
pub(crate) fn split_path(path: &Path) -> Result<Vec<String>, FileTreeError> {
    let invalid = || FileTreeError::InvalidPath(path.to_path_buf());
    let mut names = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => names.push(name.to_str().ok_or_else(invalid)?.to_string()),
            Component::CurDir => {}
            _ => return Err(invalid()),
        }
    }
    Ok(names)
}
