use crate::protocol::{Action, Command, Digest, FileTreeBuilder, InputFile};
use crate::remote_exec::{ExecutedActionMetadata, ExecutionResult, RemoteExecutionService};
use crate::sandbox::{Sandbox, SandboxCommand};
use crate::storage::{InMemoryCas, OutputDirectory, OutputFile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

/// Execution service that runs actions in a local sandbox against an in-process CAS.
pub struct LocalWorker {
    pub id: String,
    pub cas: Arc<InMemoryCas>,
    pub sandbox: Arc<dyn Sandbox>,
}

impl LocalWorker {
    pub fn new(id: &str, cas: Arc<InMemoryCas>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            id: id.to_string(),
            cas,
            sandbox,
        }
    }

    fn upload_file(&self, path: &Path, relative: &str) -> Result<OutputFile> {
        let file = InputFile::from_local_file(self.cas.protocol(), path)
            .with_context(|| format!("Failed to read output {}", path.display()))?;
        self.cas.put_verified(&file.digest, file.data().get()?)?;
        Ok(OutputFile {
            path: relative.to_string(),
            digest: file.digest,
            is_executable: file.is_executable,
        })
    }

    fn upload_directory(&self, path: &Path, relative: &str) -> Result<OutputDirectory> {
        let protocol = *self.cas.protocol();
        let mut tree = FileTreeBuilder::new();
        for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let entry_path = entry.path().strip_prefix(path)?;
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                tree.add_symlink(entry_path, target.to_string_lossy())?;
            } else if file_type.is_file() {
                tree.add_file(entry_path, InputFile::from_local_file(&protocol, entry.path())?)?;
            }
        }

        let mut blobs = Vec::new();
        let tree_digest = tree.build_tree(&protocol, |digest, data| blobs.push((digest, data)))?;
        for (digest, data) in blobs {
            if !self.cas.contains(&digest) {
                self.cas.put_verified(&digest, data.get()?)?;
            }
        }
        Ok(OutputDirectory {
            path: relative.to_string(),
            tree_digest,
        })
    }
}

#[async_trait]
impl RemoteExecutionService for LocalWorker {
    async fn execute(&self, action_digest: &Digest, label: &str) -> Result<ExecutionResult> {
        let queued = Utc::now();
        tracing::info!(worker = %self.id, action = %action_digest.short_hash(), label, "Received execution request");

        let action: Action = self.cas.read_message(action_digest)?;
        let command: Command = self.cas.read_message(&action.command_digest)?;

        let env = self
            .sandbox
            .prepare(label)
            .await
            .context("Failed to prepare sandbox for remote execution")?;
        self.cas
            .materialize_directory(&action.input_root_digest, &env.workspace_dir)
            .context("Failed to stage action inputs")?;

        let start = Utc::now();
        let exec_result = self
            .sandbox
            .execute(
                &env,
                &SandboxCommand {
                    label: label.to_string(),
                    arguments: command.arguments.clone(),
                    env_vars: command.environment(),
                },
            )
            .await
            .context("Failed to execute command in remote sandbox")?;
        let completed = Utc::now();

        let mut output_files = Vec::new();
        let mut output_directories = Vec::new();
        for relative in &command.output_paths {
            let full_path = env.workspace_dir.join(relative);
            if full_path.is_dir() {
                output_directories.push(self.upload_directory(&full_path, relative)?);
            } else if full_path.is_file() {
                output_files.push(self.upload_file(&full_path, relative)?);
            } else {
                tracing::debug!(worker = %self.id, output = %relative, "declared output was not produced");
            }
        }

        if let Err(e) = self.sandbox.cleanup(env).await {
            tracing::warn!(worker = %self.id, error = %e, "Failed to clean up sandbox");
        }

        let mut result = ExecutionResult {
            exit_code: exec_result.exit_code,
            stdout: Some(String::from_utf8_lossy(&exec_result.stdout).to_string()),
            stderr: Some(String::from_utf8_lossy(&exec_result.stderr).to_string()),
            output_files,
            output_directories,
            action_result_digest: None,
            metadata: Some(ExecutedActionMetadata {
                worker: self.id.clone(),
                queued_timestamp: Some(queued),
                execution_start_timestamp: Some(start),
                execution_completed_timestamp: Some(completed),
            }),
        };
        let encoded = self.cas.protocol().to_bytes(&result)?;
        result.action_result_digest = Some(self.cas.put(encoded));

        tracing::info!(
            worker = %self.id,
            exit_code = result.exit_code,
            outputs = result.output_files.len() + result.output_directories.len(),
            "Execution finished"
        );
        Ok(result)
    }
}
