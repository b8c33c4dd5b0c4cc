//! Staged remote execution of build actions.
//!
//! Each action flows through four limiter-gated stages: compute the action, upload its
//! inputs, execute it remotely, then delete stale outputs and materialize the results.
//! Every action produces exactly one terminal event, whichever way its pipeline ends.

use crate::config::RemoteExecutionConfig;
use crate::error::RemoteExecutionError;
use crate::events::{ActionEvents, EventBus, PipelineState, RemoteExecutionEvent, RemoteExecutionStats};
use crate::limiter::JobLimiter;
use crate::protocol::Digest;
use crate::remote_exec::{
    prepare_remote_execution, BuildAction, CancellationGuard, ExecutionResult,
    RemoteExecutionActionInfo, RemoteExecutionClients,
};
use crate::{log_action_terminal, log_remote_operation, log_upload};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutedBy {
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BuildOutcome {
    Built {
        /// Declared outputs, relative to the output root
        artifacts: Vec<PathBuf>,
        executed_by: ExecutedBy,
    },
    Cancelled {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    pub target: String,
    pub outcome: BuildOutcome,
}

impl BuildResult {
    pub fn built(target: impl Into<String>, artifacts: Vec<PathBuf>, executed_by: ExecutedBy) -> Self {
        Self {
            target: target.into(),
            outcome: BuildOutcome::Built {
                artifacts,
                executed_by,
            },
        }
    }

    pub fn cancelled(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            outcome: BuildOutcome::Cancelled {
                reason: reason.into(),
            },
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self.outcome, BuildOutcome::Built { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, BuildOutcome::Cancelled { .. })
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        match &self.outcome {
            BuildOutcome::Built { artifacts, .. } => artifacts,
            BuildOutcome::Cancelled { .. } => &[],
        }
    }
}

/// A way of building one rule.
pub trait BuildRuleStrategy: Send + Sync {
    /// Starts building `action` and returns immediately.
    fn build(&self, action: Arc<BuildAction>) -> StrategyBuildResult;

    fn can_build(&self, _action: &BuildAction) -> bool {
        true
    }
}

/// Handle to an in-flight build.
pub struct StrategyBuildResult {
    guard: Arc<CancellationGuard>,
    task: JoinHandle<Result<BuildResult, RemoteExecutionError>>,
    linked: Vec<AbortHandle>,
}

impl StrategyBuildResult {
    pub fn new(
        guard: Arc<CancellationGuard>,
        task: JoinHandle<Result<BuildResult, RemoteExecutionError>>,
    ) -> Self {
        Self {
            guard,
            task,
            linked: Vec::new(),
        }
    }

    /// Also aborts `handle` when this build is aborted.
    pub fn link(mut self, handle: AbortHandle) -> Self {
        self.linked.push(handle);
        self
    }

    pub fn guard(&self) -> &Arc<CancellationGuard> {
        &self.guard
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Requests cancellation. Has no effect once the action was dispatched for execution.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.guard.cancel(reason)
    }

    pub fn cancel_if_not_started(&self, reason: impl Into<String>) -> bool {
        self.guard.cancel_if_not_started(reason)
    }

    /// Interrupts the pipeline wherever it is. The action ends as cancelled and the result
    /// resolves to [`RemoteExecutionError::Interrupted`].
    pub fn abort(&self) {
        self.task.abort();
        for handle in &self.linked {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn build_result(self) -> Result<BuildResult, RemoteExecutionError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(from_join_error(e)),
        }
    }
}

pub(crate) fn from_join_error(e: JoinError) -> RemoteExecutionError {
    if e.is_cancelled() {
        return RemoteExecutionError::Interrupted;
    }
    match e.try_into_panic() {
        Ok(payload) => RemoteExecutionError::Panicked(panic_message(payload.as_ref())),
        Err(e) => RemoteExecutionError::Panicked(e.to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum Dispatch {
    Cancelled(String),
    Executed(ExecutionResult),
}

/// Runs build actions on a remote execution service.
///
/// Owns its limiters, event bus and statistics; two strategies never share state.
pub struct RemoteExecutionStrategy {
    inner: Arc<StrategyInner>,
    runtime: Handle,
}

struct StrategyInner {
    clients: RemoteExecutionClients,
    output_root: PathBuf,
    max_input_size_bytes: Option<u64>,
    bus: Arc<EventBus>,
    stats: Arc<RemoteExecutionStats>,
    compute_limiter: JobLimiter,
    upload_limiter: JobLimiter,
    execution_limiter: JobLimiter,
    result_limiter: JobLimiter,
}

impl RemoteExecutionStrategy {
    /// `events` receives every lifecycle event in addition to the strategy's own stats.
    pub fn new(
        config: &RemoteExecutionConfig,
        clients: RemoteExecutionClients,
        output_root: impl Into<PathBuf>,
        events: EventBus,
        runtime: Handle,
    ) -> Self {
        let stats = Arc::new(RemoteExecutionStats::new());
        let bus = Arc::new(events.with_listener(stats.clone()));
        Self {
            inner: Arc::new(StrategyInner {
                clients,
                output_root: output_root.into(),
                max_input_size_bytes: config.max_input_size_bytes,
                bus,
                stats,
                compute_limiter: JobLimiter::new(
                    "compute",
                    config.max_concurrent_action_computations,
                ),
                upload_limiter: JobLimiter::new("upload", config.max_concurrent_pending_uploads),
                execution_limiter: JobLimiter::new("execute", config.max_concurrent_executions),
                result_limiter: JobLimiter::new(
                    "handle_result",
                    config.max_concurrent_result_handling,
                ),
            }),
            runtime,
        }
    }

    pub fn stats(&self) -> &Arc<RemoteExecutionStats> {
        &self.inner.stats
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn output_root(&self) -> &Path {
        &self.inner.output_root
    }

    /// The compute, upload, execute and result-handling limiters, in pipeline order
    pub fn limiters(&self) -> [&JobLimiter; 4] {
        [
            &self.inner.compute_limiter,
            &self.inner.upload_limiter,
            &self.inner.execution_limiter,
            &self.inner.result_limiter,
        ]
    }
}

impl BuildRuleStrategy for RemoteExecutionStrategy {
    fn build(&self, action: Arc<BuildAction>) -> StrategyBuildResult {
        let guard = Arc::new(CancellationGuard::new());
        let events = ActionEvents::scheduled(self.inner.bus.clone(), action.target.clone());
        let span = tracing::info_span!("remote_action", rule = %action.target);

        let inner = self.inner.clone();
        let task_guard = guard.clone();
        let task = self.runtime.spawn(
            async move {
                // Bound first so that on abort every open state scope closes before the
                // emitter's drop posts the terminal event.
                let events = events;
                // A panicking stage ends the action as failed, not cancelled.
                let result = AssertUnwindSafe(inner.run_pipeline(&action, &events, &task_guard))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(RemoteExecutionError::Panicked(panic_message(payload.as_ref())))
                    });
                inner.finish(&action, &events, &result);
                result
            }
            .instrument(span),
        );
        StrategyBuildResult::new(guard, task)
    }
}

impl StrategyInner {
    /// Emits the terminal event for paths that have not posted one yet.
    fn finish(
        &self,
        action: &BuildAction,
        events: &ActionEvents,
        result: &Result<BuildResult, RemoteExecutionError>,
    ) {
        let state = match result {
            Ok(build) if build.is_cancelled() => PipelineState::ActionCancelled,
            Ok(_) => PipelineState::ActionSucceeded,
            Err(e) if e.is_interruption() => PipelineState::ActionCancelled,
            Err(e) => {
                tracing::warn!(rule = %action.target, error = %e, "Remote build failed");
                PipelineState::ActionFailed
            }
        };
        events.terminal(state, None, None);
        log_action_terminal!(action.target, events.current_state());

        if matches!(result, Ok(build) if build.is_built()) {
            self.bus.post(RemoteExecutionEvent::RuleBuilt {
                target: action.target.clone(),
            });
        }
    }

    async fn run_pipeline(
        &self,
        action: &Arc<BuildAction>,
        events: &ActionEvents,
        guard: &CancellationGuard,
    ) -> Result<BuildResult, RemoteExecutionError> {
        let mut info = self.compute_action(action, events).await?;

        if let Some(reason) = guard.cancellation_reason() {
            tracing::info!(rule = %action.target, reason, "Cancelled before upload");
            return Ok(BuildResult::cancelled(&action.target, reason));
        }

        self.upload_inputs(&mut info, events).await?;

        let result = match self.dispatch(&action.target, &info.action_digest, events, guard).await? {
            Dispatch::Cancelled(reason) => {
                tracing::info!(rule = %action.target, reason = %reason, "Cancelled before execution");
                return Ok(BuildResult::cancelled(&action.target, reason));
            }
            Dispatch::Executed(result) => result,
        };

        let info = &info;
        self.result_limiter
            .schedule(move || async move { self.handle_result(action, info, result, events).await })
            .await
    }

    async fn compute_action(
        &self,
        action: &Arc<BuildAction>,
        events: &ActionEvents,
    ) -> Result<RemoteExecutionActionInfo, RemoteExecutionError> {
        let protocol = self.clients.protocol;
        self.compute_limiter
            .schedule(move || async move {
                let _scope = events.scope(PipelineState::ComputingAction, None);
                let action = action.clone();
                tokio::task::spawn_blocking(move || prepare_remote_execution(&protocol, &action))
                    .await
                    .map_err(from_join_error)?
            })
            .await
    }

    async fn upload_inputs(
        &self,
        info: &mut RemoteExecutionActionInfo,
        events: &ActionEvents,
    ) -> Result<(), RemoteExecutionError> {
        let total_bytes = info.total_input_size();
        let required = info.take_required_data();
        let info = &*info;
        let max_input_size = self.max_input_size_bytes;

        self.upload_limiter
            .schedule(move || async move {
                if let Some(max_bytes) = max_input_size {
                    if total_bytes > max_bytes {
                        return Err(RemoteExecutionError::InputSizeExceeded {
                            total_bytes,
                            max_bytes,
                        });
                    }
                }

                let _scope = events.scope(PipelineState::UploadingInputs, Some(&info.action_digest));
                let started = Instant::now();
                let blob_count = required.len();
                self.clients
                    .storage
                    .add_missing(required)
                    .await
                    .map_err(|source| RemoteExecutionError::Storage {
                        operation: "upload inputs",
                        source,
                    })?;
                log_remote_operation!("add_missing", "ok", started.elapsed().as_millis() as u64);
                log_upload!(info.action_digest, blob_count, total_bytes);

                events.bus().post(RemoteExecutionEvent::CasUpload {
                    blobs: info.input_file_count as u64,
                    bytes: info.input_file_bytes,
                });
                Ok(())
            })
            .await
    }

    async fn dispatch(
        &self,
        target: &str,
        action_digest: &Digest,
        events: &ActionEvents,
        guard: &CancellationGuard,
    ) -> Result<Dispatch, RemoteExecutionError> {
        self.execution_limiter
            .schedule(move || async move {
                // Point of no return: past this, cancellation no longer applies.
                if let Err(reason) = guard.try_start() {
                    return Ok::<_, RemoteExecutionError>(Dispatch::Cancelled(reason));
                }

                let _scope = events.scope(PipelineState::Executing, Some(action_digest));
                let started = Instant::now();
                let result = self
                    .clients
                    .execution
                    .execute(action_digest, target)
                    .await
                    .map_err(|source| RemoteExecutionError::Execution { source })?;
                log_remote_operation!("execute", result.exit_code, started.elapsed().as_millis() as u64);
                Ok(Dispatch::Executed(result))
            })
            .await
    }

    async fn handle_result(
        &self,
        action: &BuildAction,
        info: &RemoteExecutionActionInfo,
        result: ExecutionResult,
        events: &ActionEvents,
    ) -> Result<BuildResult, RemoteExecutionError> {
        let action_digest = &info.action_digest;

        if result.exit_code != 0 {
            events.terminal(
                PipelineState::ActionFailed,
                Some(action_digest),
                result.metadata.clone(),
            );
            return Err(RemoteExecutionError::StepFailed {
                exit_code: result.exit_code,
                stderr: result.stderr.unwrap_or_default(),
            });
        }

        {
            let _scope = events.scope(PipelineState::DeletingStaleOutputs, Some(action_digest));
            for output in &info.outputs {
                delete_stale_output(&self.output_root.join(output)).await?;
            }
        }

        {
            let _scope = events.scope(PipelineState::MaterializingOutputs, Some(action_digest));
            let started = Instant::now();
            self.clients
                .storage
                .materialize_outputs(
                    &result.output_directories,
                    &result.output_files,
                    &self.output_root,
                )
                .await
                .map_err(|source| RemoteExecutionError::Storage {
                    operation: "materialize outputs",
                    source,
                })?;
            log_remote_operation!("materialize", "ok", started.elapsed().as_millis() as u64);

            let (blobs, bytes) = download_totals(&result);
            events
                .bus()
                .post(RemoteExecutionEvent::CasDownload { blobs, bytes });
        }

        events.terminal(
            PipelineState::ActionSucceeded,
            Some(action_digest),
            result.metadata,
        );
        Ok(BuildResult::built(
            &action.target,
            info.outputs.clone(),
            ExecutedBy::Remote,
        ))
    }
}

fn download_totals(result: &ExecutionResult) -> (u64, u64) {
    let files = result.output_files.iter().map(|f| f.digest.size_bytes);
    let trees = result
        .output_directories
        .iter()
        .map(|d| d.tree_digest.size_bytes);
    let sizes: Vec<u64> = files.chain(trees).collect();
    (sizes.len() as u64, sizes.iter().sum())
}

/// Removes whatever currently sits at `path`; a missing path is fine.
async fn delete_stale_output(path: &Path) -> Result<(), RemoteExecutionError> {
    let stale = |source: io::Error| RemoteExecutionError::StaleOutput {
        path: path.to_path_buf(),
        source,
    };
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(stale(e)),
    };
    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match removed {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(stale(e)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;
    use crate::storage::{OutputDirectory, OutputFile};

    #[test]
    fn test_download_totals() {
        let protocol = Protocol::default();
        let result = ExecutionResult {
            output_files: vec![OutputFile {
                path: "a".into(),
                digest: protocol.compute_digest(b"1234"),
                is_executable: false,
            }],
            output_directories: vec![OutputDirectory {
                path: "d".into(),
                tree_digest: Digest::new("ff", 10),
            }],
            ..Default::default()
        };
        assert_eq!(download_totals(&result), (2, 14));
    }

    #[tokio::test]
    async fn test_delete_stale_output() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.txt");
        std::fs::write(&file, b"old").unwrap();
        let tree = dir.path().join("dist");
        std::fs::create_dir_all(tree.join("nested")).unwrap();
        std::fs::write(tree.join("nested/x"), b"old").unwrap();

        delete_stale_output(&file).await.unwrap();
        delete_stale_output(&tree).await.unwrap();
        delete_stale_output(&dir.path().join("never-existed")).await.unwrap();

        assert!(!file.exists());
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn test_join_error_mapping() {
        let aborted = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        aborted.abort();
        assert!(matches!(
            from_join_error(aborted.await.unwrap_err()),
            RemoteExecutionError::Interrupted
        ));

        let panicked = tokio::spawn(async { panic!("kaboom") });
        match from_join_error(panicked.await.unwrap_err()) {
            RemoteExecutionError::Panicked(msg) => assert_eq!(msg, "kaboom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_build_result_accessors() {
        let built = BuildResult::built("t", vec![PathBuf::from("a")], ExecutedBy::Remote);
        assert!(built.is_built());
        assert_eq!(built.artifacts(), &[PathBuf::from("a")]);
        let cancelled = BuildResult::cancelled("t", "stop");
        assert!(cancelled.is_cancelled());
        assert!(cancelled.artifacts().is_empty());
    }
}
