#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rexec::config::RemoteExecutionConfig;
use rexec::events::{EventBus, FallbackResult, PipelineState, RemoteExecutionEvent, RemoteExecutionListener};
use rexec::protocol::{Digest, InputFile, Protocol, UploadDataSupplier};
use rexec::remote_exec::{
    BuildAction, BuildResult, ExecutedActionMetadata, ExecutedBy, ExecutionResult, LocalBuilder,
    RemoteExecutionClients, RemoteExecutionService, RemoteExecutionStrategy,
};
use rexec::storage::{ContentAddressedStorage, OutputDirectory, OutputFile};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Storage double that records what the pipeline asked of it.
#[derive(Default)]
pub struct RecordingStorage {
    pub add_missing_calls: AtomicUsize,
    pub uploaded_blobs: AtomicUsize,
    pub uploaded_bytes: AtomicU64,
    pub materialize_calls: AtomicUsize,
    pub materialized_files: Mutex<Vec<OutputFile>>,
    /// Uploads that reached the storage, gated or not
    pub uploads_entered: AtomicUsize,
    pub upload_gate: Option<Arc<Semaphore>>,
    pub fail_uploads: bool,
}

impl RecordingStorage {
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            upload_gate: Some(gate),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_uploads: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContentAddressedStorage for RecordingStorage {
    async fn add_missing(&self, blobs: HashMap<Digest, UploadDataSupplier>) -> anyhow::Result<()> {
        self.uploads_entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.upload_gate {
            let _permit = gate.acquire().await?;
        }
        if self.fail_uploads {
            anyhow::bail!("CAS unavailable");
        }
        self.add_missing_calls.fetch_add(1, Ordering::SeqCst);
        self.uploaded_blobs.fetch_add(blobs.len(), Ordering::SeqCst);
        let bytes: u64 = blobs.keys().map(|d| d.size_bytes).sum();
        self.uploaded_bytes.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    async fn materialize_outputs(
        &self,
        _output_directories: &[OutputDirectory],
        output_files: &[OutputFile],
        _output_root: &Path,
    ) -> anyhow::Result<()> {
        self.materialize_calls.fetch_add(1, Ordering::SeqCst);
        self.materialized_files.lock().extend_from_slice(output_files);
        Ok(())
    }
}

#[derive(Clone)]
pub enum Script {
    Exit { code: i32, stderr: String },
    Error(String),
    Panic(String),
}

/// Execution service double returning a fixed outcome for every action.
pub struct ScriptedExecutor {
    script: Script,
    pub calls: AtomicUsize,
    pub entered: Mutex<Vec<String>>,
    pub gate: Option<Arc<Semaphore>>,
}

impl ScriptedExecutor {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            entered: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Script::Exit {
            code: 0,
            stderr: String::new(),
        })
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn entered_labels(&self) -> Vec<String> {
        self.entered.lock().clone()
    }
}

#[async_trait]
impl RemoteExecutionService for ScriptedExecutor {
    async fn execute(&self, _action_digest: &Digest, label: &str) -> anyhow::Result<ExecutionResult> {
        self.entered.lock().push(label.to_string());
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await?;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        match &self.script {
            Script::Error(message) => anyhow::bail!("{}", message),
            Script::Panic(message) => panic!("{}", message),
            Script::Exit { code, stderr } => {
                let protocol = Protocol::default();
                let output_files = if *code == 0 {
                    vec![OutputFile {
                        path: "out.bin".to_string(),
                        digest: protocol.compute_digest(b"output"),
                        is_executable: false,
                    }]
                } else {
                    Vec::new()
                };
                let now = chrono::Utc::now();
                Ok(ExecutionResult {
                    exit_code: *code,
                    stderr: Some(stderr.clone()),
                    output_files,
                    metadata: Some(ExecutedActionMetadata {
                        worker: "scripted".to_string(),
                        queued_timestamp: Some(now),
                        execution_start_timestamp: Some(now),
                        execution_completed_timestamp: Some(now + chrono::Duration::milliseconds(250)),
                    }),
                    ..Default::default()
                })
            }
        }
    }
}

/// Listener that keeps every event it sees.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RemoteExecutionEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<RemoteExecutionEvent> {
        self.events.lock().clone()
    }

    pub fn terminal_states(&self) -> Vec<PipelineState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RemoteExecutionEvent::Terminal { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn terminal_states_for(&self, target: &str) -> Vec<PipelineState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RemoteExecutionEvent::Terminal { state, target: t, .. } if t == target => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn fallback_results(&self) -> Vec<(FallbackResult, FallbackResult)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RemoteExecutionEvent::LocalFallback { remote, local, .. } => Some((*remote, *local)),
                _ => None,
            })
            .collect()
    }
}

impl RemoteExecutionListener for RecordingListener {
    fn on_event(&self, event: &RemoteExecutionEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Local builder double; succeeds unless told otherwise.
#[derive(Default)]
pub struct RecordingLocalBuilder {
    pub runs: AtomicUsize,
    pub fail: bool,
}

impl RecordingLocalBuilder {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalBuilder for RecordingLocalBuilder {
    async fn run_locally(&self, action: &BuildAction) -> anyhow::Result<BuildResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("local execution of {} failed with exit code 1: nope", action.target);
        }
        Ok(BuildResult::built(&action.target, action.outputs.clone(), ExecutedBy::Local))
    }
}

/// Two inputs of 10 and 20 bytes, one declared output.
pub fn thirty_byte_action(target: &str) -> BuildAction {
    let protocol = Protocol::default();
    BuildAction::new(target, ["sh", "-c", "cat a.txt b.txt > out.bin"])
        .with_input("a.txt", InputFile::from_bytes(&protocol, vec![b'a'; 10], false))
        .unwrap()
        .with_input("b.txt", InputFile::from_bytes(&protocol, vec![b'b'; 20], false))
        .unwrap()
        .with_output("out.bin")
}

pub fn strategy(
    config: &RemoteExecutionConfig,
    storage: Arc<dyn ContentAddressedStorage>,
    executor: Arc<dyn RemoteExecutionService>,
    output_root: &Path,
    listener: Arc<RecordingListener>,
) -> RemoteExecutionStrategy {
    let clients = RemoteExecutionClients::new(Protocol::default(), storage, executor);
    RemoteExecutionStrategy::new(
        config,
        clients,
        output_root,
        EventBus::new().with_listener(listener),
        tokio::runtime::Handle::current(),
    )
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
