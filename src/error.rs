/// Error types for the remote execution pipeline
use std::path::PathBuf;
use thiserror::Error;

/// Failures while assembling an action's input tree.
#[derive(Debug, Error)]
pub enum FileTreeError {
    /// A file was added where a directory already lives, or vice versa
    #[error("path conflict at {path}: {reason}")]
    PathConflict { path: PathBuf, reason: String },
    /// Tree and output paths must be relative, non-empty, UTF-8 and free of `..`
    #[error("invalid path {0}: must be relative and normalized")]
    InvalidPath(PathBuf),
    #[error("failed to serialize directory: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the in-process content-addressed storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Blob content does not hash to the digest it was uploaded under
    #[error("CAS integrity failure: expected {expected}, got {actual} (size: {data_size} bytes)")]
    IntegrityFailure {
        expected: String,
        actual: String,
        data_size: usize,
    },
    #[error("blob {0} is missing from the CAS")]
    MissingBlob(String),
    #[error("storage error in {operation}: {reason}")]
    Io { operation: String, reason: String },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Terminal error of a single action's pipeline.
#[derive(Debug, Error)]
pub enum RemoteExecutionError {
    /// Total size of the required blobs is above the configured maximum
    #[error("Max file size exceeded for Remote Execution, action contains: {total_bytes} bytes, max allowed: {max_bytes}")]
    InputSizeExceeded { total_bytes: u64, max_bytes: u64 },
    #[error("failed to compute remote action for {target}: {reason}")]
    ActionComputation { target: String, reason: String },
    /// Upload or materialization failed in the storage collaborator
    #[error("{operation} failed: {source:#}")]
    Storage {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
    /// The execution service could not run the action at all
    #[error("remote execution failed: {source:#}")]
    Execution {
        #[source]
        source: anyhow::Error,
    },
    /// The action ran remotely and exited non-zero
    #[error("remote_execution failed with exit code {exit_code}: {stderr}")]
    StepFailed { exit_code: i32, stderr: String },
    #[error("failed to delete stale output {path}: {source}")]
    StaleOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The pipeline task was aborted before reaching a terminal state
    #[error("build was interrupted")]
    Interrupted,
    #[error("pipeline task panicked: {0}")]
    Panicked(String),
    #[error("local fallback failed after remote error ({remote}): {local:#}")]
    LocalFallbackFailed {
        remote: Box<RemoteExecutionError>,
        local: anyhow::Error,
    },
}

impl RemoteExecutionError {
    /// Interruption propagates to the caller untouched; everything else may be retried locally.
    pub fn is_fallback_eligible(&self) -> bool {
        !matches!(self, Self::Interrupted)
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Exit code of the remote step, if the failure came from the action itself
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::StepFailed { exit_code, .. } => Some(*exit_code),
            Self::LocalFallbackFailed { remote, .. } => remote.exit_code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_size_display() {
        let err = RemoteExecutionError::InputSizeExceeded {
            total_bytes: 1_000_000,
            max_bytes: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("1000000"));
        assert!(msg.contains("max allowed: 1000"));
    }

    #[test]
    fn test_step_failed_carries_stderr() {
        let err = RemoteExecutionError::StepFailed {
            exit_code: 1,
            stderr: "boom".to_string(),
        };
        assert_eq!(err.exit_code(), Some(1));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_fallback_eligibility() {
        assert!(!RemoteExecutionError::Interrupted.is_fallback_eligible());
        let storage = RemoteExecutionError::Storage {
            operation: "upload",
            source: anyhow::anyhow!("connection reset"),
        };
        assert!(storage.is_fallback_eligible());
        assert!(storage.to_string().contains("connection reset"));
    }

    #[test]
    fn test_integrity_failure_display() {
        let err = StorageError::IntegrityFailure {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
            data_size: 2048,
        };
        let msg = err.to_string();
        assert!(msg.contains("integrity failure"));
        assert!(msg.contains("2048"));
    }

    #[test]
    fn test_nested_exit_code() {
        let err = RemoteExecutionError::LocalFallbackFailed {
            remote: Box::new(RemoteExecutionError::StepFailed {
                exit_code: 3,
                stderr: String::new(),
            }),
            local: anyhow::anyhow!("local failed too"),
        };
        assert_eq!(err.exit_code(), Some(3));
    }
}
