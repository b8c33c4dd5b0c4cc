use crate::config::RemoteExecutionConfig;
use crate::error::RemoteExecutionError;
use crate::events::{EventBus, FallbackResult, RemoteExecutionEvent};
use crate::protocol::Protocol;
use crate::remote_exec::{
    BuildAction, BuildResult, BuildRuleStrategy, ExecutedBy, RemoteExecutionStrategy,
    StrategyBuildResult,
};
use crate::sandbox::{Sandbox, SandboxCommand};
use crate::storage::{ContentAddressedStorage, InMemoryCas};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::Instrument;
use walkdir::WalkDir;

/// Hook for building an action on the local machine.
#[async_trait]
pub trait LocalBuilder: Send + Sync {
    async fn run_locally(&self, action: &BuildAction) -> Result<BuildResult>;
}

/// Retries failed remote builds locally.
///
/// Exactly one `LocalFallback` event is posted per action, whether or not the local
/// builder ran.
pub struct LocalFallbackStrategy {
    delegate: Arc<dyn BuildRuleStrategy>,
    local: Arc<dyn LocalBuilder>,
    bus: Arc<EventBus>,
    fallback_on_cancellation: bool,
    runtime: Handle,
}

impl LocalFallbackStrategy {
    pub fn new(
        delegate: Arc<dyn BuildRuleStrategy>,
        local: Arc<dyn LocalBuilder>,
        bus: Arc<EventBus>,
        fallback_on_cancellation: bool,
        runtime: Handle,
    ) -> Self {
        Self {
            delegate,
            local,
            bus,
            fallback_on_cancellation,
            runtime,
        }
    }
}

impl BuildRuleStrategy for LocalFallbackStrategy {
    fn build(&self, action: Arc<BuildAction>) -> StrategyBuildResult {
        let remote = self.delegate.build(action.clone());
        let guard = remote.guard().clone();
        let remote_abort = remote.abort_handle();

        let local = self.local.clone();
        let bus = self.bus.clone();
        let fallback_on_cancellation = self.fallback_on_cancellation;
        let task_guard = guard.clone();
        let span = tracing::info_span!("local_fallback", rule = %action.target);

        let task = self.runtime.spawn(
            async move {
                let remote_result = remote.build_result().await;
                let post = |remote: FallbackResult, local: FallbackResult| {
                    bus.post(RemoteExecutionEvent::LocalFallback {
                        target: action.target.clone(),
                        remote,
                        local,
                    })
                };

                let remote_outcome = match remote_result {
                    Ok(result) if result.is_built() => {
                        post(FallbackResult::Success, FallbackResult::NotRun);
                        return Ok(result);
                    }
                    Ok(result) => {
                        if !fallback_on_cancellation || task_guard.has_started() {
                            post(FallbackResult::Cancelled, FallbackResult::NotRun);
                            return Ok(result);
                        }
                        tracing::info!(rule = %action.target, "Remote build cancelled, building locally");
                        (FallbackResult::Cancelled, None)
                    }
                    Err(e) if !e.is_fallback_eligible() => {
                        post(FallbackResult::Cancelled, FallbackResult::NotRun);
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(rule = %action.target, error = %e, "Remote build failed, falling back to local execution");
                        (FallbackResult::Fail, Some(e))
                    }
                };

                let (remote_state, remote_error) = remote_outcome;
                match local.run_locally(&action).await {
                    Ok(result) => {
                        let local_state = if result.is_built() {
                            bus.post(RemoteExecutionEvent::RuleBuilt {
                                target: action.target.clone(),
                            });
                            FallbackResult::Success
                        } else {
                            FallbackResult::Cancelled
                        };
                        post(remote_state, local_state);
                        Ok(result)
                    }
                    Err(local_error) => {
                        tracing::error!(rule = %action.target, error = %local_error, "Local fallback failed");
                        post(remote_state, FallbackResult::Fail);
                        let remote = remote_error.unwrap_or(RemoteExecutionError::Interrupted);
                        Err(RemoteExecutionError::LocalFallbackFailed {
                            remote: Box::new(remote),
                            local: local_error,
                        })
                    }
                }
            }
            .instrument(span),
        );

        StrategyBuildResult::new(guard, task).link(remote_abort)
    }

    fn can_build(&self, action: &BuildAction) -> bool {
        self.delegate.can_build(action)
    }
}

/// Wraps the remote strategy in local fallback when the config asks for it.
pub fn create_strategy(
    config: &RemoteExecutionConfig,
    remote: RemoteExecutionStrategy,
    local: Arc<dyn LocalBuilder>,
) -> Arc<dyn BuildRuleStrategy> {
    if !config.local_fallback_enabled {
        return Arc::new(remote);
    }
    let bus = remote.events().clone();
    let runtime = remote.runtime().clone();
    Arc::new(LocalFallbackStrategy::new(
        Arc::new(remote),
        local,
        bus,
        config.fallback_on_cancellation,
        runtime,
    ))
}

/// Builds actions by running their command in a local sandbox and copying the declared
/// outputs to the output root.
pub struct LocalCommandBuilder {
    sandbox: Arc<dyn Sandbox>,
    output_root: PathBuf,
    protocol: Protocol,
}

impl LocalCommandBuilder {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        output_root: impl Into<PathBuf>,
        protocol: Protocol,
    ) -> Self {
        Self {
            sandbox,
            output_root: output_root.into(),
            protocol,
        }
    }

    async fn stage_inputs(&self, action: &BuildAction, workspace: &Path) -> Result<()> {
        let staging = InMemoryCas::new(self.protocol);
        let mut blobs = HashMap::new();
        let root = action
            .inputs
            .build_tree(&self.protocol, |digest, data| {
                blobs.insert(digest, data);
            })?;
        staging.add_missing(blobs).await?;
        staging.materialize_directory(&root, workspace)
    }
}

#[async_trait]
impl LocalBuilder for LocalCommandBuilder {
    async fn run_locally(&self, action: &BuildAction) -> Result<BuildResult> {
        action.validate_outputs()?;
        let env = self.sandbox.prepare(&action.target).await?;
        self.stage_inputs(action, &env.workspace_dir)
            .await
            .context("Failed to stage inputs for local build")?;

        let exec = self
            .sandbox
            .execute(
                &env,
                &SandboxCommand {
                    label: action.target.clone(),
                    arguments: action.arguments.clone(),
                    env_vars: action.environment.clone(),
                },
            )
            .await?;
        if exec.exit_code != 0 {
            let stderr = String::from_utf8_lossy(&exec.stderr).to_string();
            self.sandbox.cleanup(env).await.ok();
            anyhow::bail!(
                "local execution of {} failed with exit code {}: {}",
                action.target,
                exec.exit_code,
                stderr.trim()
            );
        }

        for output in &action.outputs {
            copy_output(&env.workspace_dir.join(output), &self.output_root.join(output))
                .with_context(|| format!("Failed to collect output {}", output.display()))?;
        }
        self.sandbox.cleanup(env).await.ok();

        let mut artifacts = action.outputs.clone();
        artifacts.sort();
        artifacts.dedup();
        Ok(BuildResult::built(&action.target, artifacts, ExecutedBy::Local))
    }
}

fn copy_output(from: &Path, to: &Path) -> Result<()> {
    if to.symlink_metadata().is_ok() {
        if to.is_dir() {
            std::fs::remove_dir_all(to)?;
        } else {
            std::fs::remove_file(to)?;
        }
    }
    if from.is_dir() {
        for entry in WalkDir::new(from) {
            let entry = entry?;
            let dest = to.join(entry.path().strip_prefix(from)?);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&dest)?;
            } else {
                std::fs::copy(entry.path(), &dest)?;
            }
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
    }
    Ok(())
}
