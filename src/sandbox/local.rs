use crate::sandbox::{ExecResult, Sandbox, SandboxCommand, SandboxEnv};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

/// Runs commands as local processes, each in a fresh temporary workspace.
pub struct LocalSandbox {
    /// Parent of the per-action workspaces; the system temp dir when unset
    pub base_dir: Option<PathBuf>,
}

impl LocalSandbox {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self { base_dir }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn prepare(&self, label: &str) -> Result<SandboxEnv> {
        let prefix = format!("rexec-{}-", sanitize(label));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let tempdir = match &self.base_dir {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
        .context("Failed to create sandbox workspace")?;

        Ok(SandboxEnv {
            workspace_dir: tempdir.path().to_path_buf(),
            tempdir: Some(tempdir),
        })
    }

    async fn execute(&self, env: &SandboxEnv, command: &SandboxCommand) -> Result<ExecResult> {
        let Some((program, args)) = command.arguments.split_first() else {
            anyhow::bail!("{}: empty command line", command.label);
        };

        let output = Command::new(program)
            .args(args)
            .envs(&command.env_vars)
            .current_dir(&env.workspace_dir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", program))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn cleanup(&self, env: SandboxEnv) -> Result<()> {
        if let Some(tempdir) = env.tempdir {
            tempdir.close()?;
        }
        Ok(())
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(32)
        .collect()
}
