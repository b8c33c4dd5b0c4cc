use crate::protocol::{Digest, Protocol};
use crate::storage::{ContentAddressedStorage, OutputDirectory, OutputFile};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod action;
pub mod fallback;
pub mod guard;
pub mod strategy;
pub mod worker;

pub use action::{prepare_remote_execution, BuildAction, RemoteExecutionActionInfo};
pub use fallback::{create_strategy, LocalBuilder, LocalCommandBuilder, LocalFallbackStrategy};
pub use guard::CancellationGuard;
pub use strategy::{
    BuildOutcome, BuildResult, BuildRuleStrategy, ExecutedBy, RemoteExecutionStrategy,
    StrategyBuildResult,
};
pub use worker::LocalWorker;

/// Where and when an action ran on the remote side.
/// Maps to: google.devtools.remoteexecution.v2.ExecutedActionMetadata
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ExecutedActionMetadata {
    pub worker: String,
    pub queued_timestamp: Option<DateTime<Utc>>,
    pub execution_start_timestamp: Option<DateTime<Utc>>,
    pub execution_completed_timestamp: Option<DateTime<Utc>>,
}

impl ExecutedActionMetadata {
    /// Remote CPU time spent on the action, when both timestamps are known
    pub fn execution_duration(&self) -> Option<Duration> {
        let start = self.execution_start_timestamp?;
        let completed = self.execution_completed_timestamp?;
        (completed - start).to_std().ok()
    }
}

/// ExecutionResult represents the result of a remote execution.
/// Maps to: google.devtools.remoteexecution.v2.ActionResult
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub output_files: Vec<OutputFile>,
    pub output_directories: Vec<OutputDirectory>,
    pub action_result_digest: Option<Digest>,
    pub metadata: Option<ExecutedActionMetadata>,
}

#[async_trait]
pub trait RemoteExecutionService: Send + Sync {
    /// Runs an action whose inputs are already in storage.
    async fn execute(&self, action_digest: &Digest, label: &str) -> Result<ExecutionResult>;
}

/// Everything the orchestrator needs to talk to a remote backend.
#[derive(Clone)]
pub struct RemoteExecutionClients {
    pub protocol: Protocol,
    pub storage: Arc<dyn ContentAddressedStorage>,
    pub execution: Arc<dyn RemoteExecutionService>,
}

impl RemoteExecutionClients {
    pub fn new(
        protocol: Protocol,
        storage: Arc<dyn ContentAddressedStorage>,
        execution: Arc<dyn RemoteExecutionService>,
    ) -> Self {
        Self {
            protocol,
            storage,
            execution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_execution_duration() {
        let metadata = ExecutedActionMetadata {
            worker: "w".into(),
            queued_timestamp: None,
            execution_start_timestamp: Some(Utc.timestamp_opt(10, 0).unwrap()),
            execution_completed_timestamp: Some(Utc.timestamp_opt(12, 500_000_000).unwrap()),
        };
        assert_eq!(metadata.execution_duration(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_execution_duration_requires_both_timestamps() {
        let metadata = ExecutedActionMetadata {
            execution_start_timestamp: Some(Utc::now()),
            ..Default::default()
        };
        assert_eq!(metadata.execution_duration(), None);
    }

    #[test]
    fn test_clock_skew_yields_no_duration() {
        let metadata = ExecutedActionMetadata {
            worker: "w".into(),
            queued_timestamp: None,
            execution_start_timestamp: Some(Utc.timestamp_opt(20, 0).unwrap()),
            execution_completed_timestamp: Some(Utc.timestamp_opt(10, 0).unwrap()),
        };
        assert_eq!(metadata.execution_duration(), None);
    }
}
