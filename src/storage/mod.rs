use crate::protocol::{Digest, UploadDataSupplier};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub mod memory;

pub use memory::InMemoryCas;

/// Maps to: google.devtools.remoteexecution.v2.OutputFile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Relative to the output root
    pub path: String,
    pub digest: Digest,
    pub is_executable: bool,
}

/// An output directory, stored as a merkle tree whose root `Directory` blob is `tree_digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDirectory {
    pub path: String,
    pub tree_digest: Digest,
}

#[async_trait]
pub trait ContentAddressedStorage: Send + Sync {
    /// Uploads every blob the store does not already have.
    async fn add_missing(&self, blobs: HashMap<Digest, UploadDataSupplier>) -> Result<()>;

    /// Writes the given outputs below `output_root`, replacing whatever is there.
    async fn materialize_outputs(
        &self,
        output_directories: &[OutputDirectory],
        output_files: &[OutputFile],
        output_root: &Path,
    ) -> Result<()>;
}
