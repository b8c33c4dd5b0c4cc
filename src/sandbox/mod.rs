use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub mod local;

pub use local::LocalSandbox;

/// A command to run inside a sandbox, argv-style.
#[derive(Debug, Clone, Default)]
pub struct SandboxCommand {
    pub label: String,
    pub arguments: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct SandboxEnv {
    pub workspace_dir: PathBuf,
    /// Keeps a temporary workspace alive until cleanup
    pub tempdir: Option<tempfile::TempDir>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn prepare(&self, label: &str) -> Result<SandboxEnv>;
    async fn execute(&self, env: &SandboxEnv, command: &SandboxCommand) -> Result<ExecResult>;
    async fn cleanup(&self, env: SandboxEnv) -> Result<()>;
}
