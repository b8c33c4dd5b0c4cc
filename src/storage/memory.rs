use crate::error::StorageError;
use crate::log_cas_verify_fail;
use crate::protocol::{Digest, Directory, Protocol, UploadDataSupplier};
use crate::storage::{ContentAddressedStorage, OutputDirectory, OutputFile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Content-addressed blob store held in memory.
///
/// Every blob is verified against its digest on the way in, so a stored blob always hashes to
/// its key.
pub struct InMemoryCas {
    protocol: Protocol,
    blobs: RwLock<HashMap<Digest, Arc<[u8]>>>,
}

impl InMemoryCas {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Stores `data` under its own digest.
    pub fn put(&self, data: Vec<u8>) -> Digest {
        let digest = self.protocol.compute_digest(&data);
        self.blobs
            .write()
            .entry(digest.clone())
            .or_insert_with(|| data.into());
        digest
    }

    /// Stores `data` under `digest` after checking that it actually hashes to it.
    pub fn put_verified(&self, digest: &Digest, data: Vec<u8>) -> Result<(), StorageError> {
        let actual = self.protocol.compute_digest(&data);
        if &actual != digest {
            log_cas_verify_fail!(digest.hash, actual.hash, data.len());
            return Err(StorageError::IntegrityFailure {
                expected: digest.to_string(),
                actual: actual.to_string(),
                data_size: data.len(),
            });
        }
        self.blobs
            .write()
            .entry(actual)
            .or_insert_with(|| data.into());
        Ok(())
    }

    pub fn get(&self, digest: &Digest) -> Option<Arc<[u8]>> {
        self.blobs.read().get(digest).cloned()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.read().contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    fn require(&self, digest: &Digest) -> Result<Arc<[u8]>, StorageError> {
        self.get(digest)
            .ok_or_else(|| StorageError::MissingBlob(digest.to_string()))
    }

    pub fn read_message<M: DeserializeOwned>(&self, digest: &Digest) -> Result<M> {
        let data = self.require(digest)?;
        self.protocol
            .parse(&data)
            .with_context(|| format!("blob {} is not a valid message", digest))
    }

    /// Recreates the directory tree rooted at `digest` under `dest`.
    pub fn materialize_directory(&self, digest: &Digest, dest: &Path) -> Result<()> {
        let directory: Directory = self.read_message(digest)?;
        fs::create_dir_all(dest)
            .with_context(|| format!("failed to create directory {}", dest.display()))?;

        for file in &directory.files {
            self.write_file(&file.digest, file.is_executable, &dest.join(&file.name))?;
        }
        for child in &directory.directories {
            self.materialize_directory(&child.digest, &dest.join(&child.name))?;
        }
        for link in &directory.symlinks {
            create_symlink(&link.target, &dest.join(&link.name))?;
        }
        Ok(())
    }

    fn write_file(&self, digest: &Digest, is_executable: bool, path: &Path) -> Result<()> {
        let data = self.require(digest)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &data).with_context(|| format!("failed to write {}", path.display()))?;
        if is_executable {
            set_executable(path)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContentAddressedStorage for InMemoryCas {
    async fn add_missing(&self, blobs: HashMap<Digest, UploadDataSupplier>) -> Result<()> {
        for (digest, supplier) in blobs {
            if self.contains(&digest) {
                continue;
            }
            let data = supplier.get().map_err(|e| StorageError::Io {
                operation: "read upload data".to_string(),
                reason: format!("{}: {}", digest, e),
            })?;
            self.put_verified(&digest, data)?;
        }
        Ok(())
    }

    async fn materialize_outputs(
        &self,
        output_directories: &[OutputDirectory],
        output_files: &[OutputFile],
        output_root: &Path,
    ) -> Result<()> {
        for dir in output_directories {
            self.materialize_directory(&dir.tree_digest, &output_root.join(&dir.path))?;
        }
        for file in output_files {
            self.write_file(&file.digest, file.is_executable, &output_root.join(&file.path))?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("failed to create symlink {}", link.display()))
}

#[cfg(not(unix))]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    anyhow::bail!(
        "symlink outputs are not supported on this platform: {} -> {}",
        link.display(),
        target
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileTreeBuilder, InputFile};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_add_missing_and_get() {
        let protocol = Protocol::default();
        let cas = InMemoryCas::new(protocol);
        let digest = protocol.compute_digest(b"hello");
        let mut blobs = HashMap::new();
        blobs.insert(digest.clone(), UploadDataSupplier::from_bytes(b"hello".to_vec()));

        cas.add_missing(blobs).await.unwrap();
        assert!(cas.contains(&digest));
        assert_eq!(&*cas.get(&digest).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_rejects_corrupt_upload() {
        let protocol = Protocol::default();
        let cas = InMemoryCas::new(protocol);
        let digest = protocol.compute_digest(b"expected");
        let mut blobs = HashMap::new();
        blobs.insert(digest.clone(), UploadDataSupplier::from_bytes(b"tampered".to_vec()));

        let err = cas.add_missing(blobs).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::IntegrityFailure { .. })
        ));
        assert!(cas.is_empty());
    }

    #[tokio::test]
    async fn test_present_blobs_are_not_read_again() {
        let protocol = Protocol::default();
        let cas = InMemoryCas::new(protocol);
        let digest = cas.put(b"cached".to_vec());
        let mut blobs = HashMap::new();
        blobs.insert(
            digest,
            UploadDataSupplier::new(|| Err(std::io::Error::other("must not be called"))),
        );
        cas.add_missing(blobs).await.unwrap();
        assert_eq!(cas.len(), 1);
    }

    #[tokio::test]
    async fn test_materialize_outputs() {
        let protocol = Protocol::default();
        let cas = InMemoryCas::new(protocol);

        let mut tree = FileTreeBuilder::new();
        tree.add_file("lib/a.txt", InputFile::from_bytes(&protocol, b"a".to_vec(), false))
            .unwrap();
        tree.add_file("bin/run", InputFile::from_bytes(&protocol, b"#!/bin/sh".to_vec(), true))
            .unwrap();
        let mut blobs = HashMap::new();
        let tree_digest = tree
            .build_tree(&protocol, |d, s| {
                blobs.insert(d, s);
            })
            .unwrap();
        cas.add_missing(blobs).await.unwrap();
        let file_digest = cas.put(b"report".to_vec());

        let out = tempdir().unwrap();
        cas.materialize_outputs(
            &[OutputDirectory {
                path: "dist".into(),
                tree_digest,
            }],
            &[OutputFile {
                path: "logs/report.txt".into(),
                digest: file_digest,
                is_executable: false,
            }],
            out.path(),
        )
        .await
        .unwrap();

        assert_eq!(fs::read(out.path().join("dist/lib/a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(out.path().join("logs/report.txt")).unwrap(), b"report");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(out.path().join("dist/bin/run"))
                .unwrap()
                .permissions()
                .mode();
            assert_ne!(mode & 0o111, 0);
        }
    }

    #[tokio::test]
    async fn test_materialize_missing_blob_fails() {
        let protocol = Protocol::default();
        let cas = InMemoryCas::new(protocol);
        let out = tempdir().unwrap();
        let result = cas
            .materialize_outputs(
                &[],
                &[OutputFile {
                    path: "x".into(),
                    digest: protocol.compute_digest(b"nowhere"),
                    is_executable: false,
                }],
                out.path(),
            )
            .await;
        assert!(result.is_err());
    }
}
