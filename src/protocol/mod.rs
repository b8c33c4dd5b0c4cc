//! Content-addressed identities and the wire messages built from them.
//!
//! Digest follows the Bazel / REAPI (Remote Execution API) model: objects are identified by
//! their content hash and size. Messages are serialized as JSON with a fixed field order and
//! pre-sorted collections, so logically identical messages always produce identical bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod tree;

pub use tree::{FileTreeBuilder, InputFile};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub size_bytes: u64,
}

impl Digest {
    pub fn new(hash: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    /// First 8 hex characters, for log lines
    pub fn short_hash(&self) -> &str {
        self.hash.get(..8).unwrap_or(&self.hash)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    #[default]
    Sha256,
    Blake3,
}

impl HashFunction {
    pub fn hash_bytes(&self, data: &[u8]) -> String {
        match self {
            HashFunction::Sha256 => hex::encode(Sha256::digest(data)),
            HashFunction::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }
}

impl std::str::FromStr for HashFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashFunction::Sha256),
            "blake3" => Ok(HashFunction::Blake3),
            other => Err(format!("unknown hash function: {}", other)),
        }
    }
}

/// Lazy, re-invocable source of a blob's bytes.
///
/// The same supplier may be called once per upload attempt and once per action referencing
/// the blob, so it must never wrap a single-use stream.
#[derive(Clone)]
pub struct UploadDataSupplier(Arc<dyn Fn() -> io::Result<Vec<u8>> + Send + Sync>);

impl UploadDataSupplier {
    pub fn new<F>(supplier: F) -> Self
    where
        F: Fn() -> io::Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self(Arc::new(supplier))
    }

    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Self {
        let data: Arc<[u8]> = data.into();
        Self::new(move || Ok(data.to_vec()))
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(move || std::fs::read(&path))
    }

    pub fn get(&self) -> io::Result<Vec<u8>> {
        (self.0)()
    }
}

impl fmt::Debug for UploadDataSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UploadDataSupplier")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub arguments: Vec<String>,
    /// Sorted by name
    pub environment_variables: Vec<EnvironmentVariable>,
    /// Sorted and deduplicated, relative to the input root
    pub output_paths: Vec<String>,
}

impl Command {
    pub fn environment(&self) -> BTreeMap<String, String> {
        self.environment_variables
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub command_digest: Digest,
    pub input_root_digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkNode {
    pub name: String,
    pub target: String,
}

/// One level of a merkle input tree. Children are kept sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Directory {
    pub files: Vec<FileNode>,
    pub directories: Vec<DirectoryNode>,
    pub symlinks: Vec<SymlinkNode>,
}

/// Hashing and serialization rules shared by every participant of a remote build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protocol {
    hash_function: HashFunction,
}

impl Protocol {
    pub fn new(hash_function: HashFunction) -> Self {
        Self { hash_function }
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash_function
    }

    pub fn compute_digest(&self, data: &[u8]) -> Digest {
        Digest::new(self.hash_function.hash_bytes(data), data.len() as u64)
    }

    /// Builds a command with canonical environment and output ordering.
    pub fn new_command<A, E, K, V, O, P>(&self, arguments: A, environment: E, outputs: O) -> Command
    where
        A: IntoIterator,
        A::Item: Into<String>,
        E: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        O: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let environment: BTreeMap<String, String> = environment
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut output_paths: Vec<String> = outputs
            .into_iter()
            .map(|p| p.as_ref().to_string_lossy().to_string())
            .collect();
        output_paths.sort();
        output_paths.dedup();

        Command {
            arguments: arguments.into_iter().map(Into::into).collect(),
            environment_variables: environment
                .into_iter()
                .map(|(name, value)| EnvironmentVariable { name, value })
                .collect(),
            output_paths,
        }
    }

    pub fn new_action(&self, command_digest: Digest, input_root_digest: Digest) -> Action {
        Action {
            command_digest,
            input_root_digest,
        }
    }

    pub fn new_directory(
        &self,
        mut files: Vec<FileNode>,
        mut directories: Vec<DirectoryNode>,
        mut symlinks: Vec<SymlinkNode>,
    ) -> Directory {
        files.sort_by(|a, b| a.name.cmp(&b.name));
        directories.sort_by(|a, b| a.name.cmp(&b.name));
        symlinks.sort_by(|a, b| a.name.cmp(&b.name));
        Directory {
            files,
            directories,
            symlinks,
        }
    }

    pub fn to_bytes<M: Serialize>(&self, message: &M) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(message)
    }

    pub fn parse<M: DeserializeOwned>(&self, data: &[u8]) -> serde_json::Result<M> {
        serde_json::from_slice(data)
    }

    /// Serializes a message and returns its digest together with the bytes.
    pub fn digest_message<M: Serialize>(&self, message: &M) -> serde_json::Result<(Digest, Vec<u8>)> {
        let data = self.to_bytes(message)?;
        Ok((self.compute_digest(&data), data))
    }
}
