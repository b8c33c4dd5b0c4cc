//! Lifecycle events of remote actions and the bus that fans them out to listeners.

use crate::protocol::Digest;
use crate::remote_exec::ExecutedActionMetadata;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

pub mod console;
pub mod stats;

pub use stats::{LocalFallbackStats, RemoteExecutionStats, StatsSnapshot};

/// Where an action is in its remote pipeline. Variants are declared in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PipelineState {
    Waiting,
    ComputingAction,
    UploadingInputs,
    Executing,
    DeletingStaleOutputs,
    MaterializingOutputs,
    ActionSucceeded,
    ActionFailed,
    ActionCancelled,
}

impl PipelineState {
    pub const ALL: [PipelineState; 9] = [
        PipelineState::Waiting,
        PipelineState::ComputingAction,
        PipelineState::UploadingInputs,
        PipelineState::Executing,
        PipelineState::DeletingStaleOutputs,
        PipelineState::MaterializingOutputs,
        PipelineState::ActionSucceeded,
        PipelineState::ActionFailed,
        PipelineState::ActionCancelled,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::ActionSucceeded
                | PipelineState::ActionFailed
                | PipelineState::ActionCancelled
        )
    }

    /// Forward-only; terminal states are absorbing.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        !self.is_terminal() && next > self
    }

    pub fn short_name(self) -> &'static str {
        match self {
            PipelineState::Waiting => "wait",
            PipelineState::DeletingStaleOutputs => "del",
            PipelineState::ComputingAction => "comp",
            PipelineState::UploadingInputs => "upl",
            PipelineState::Executing => "exec",
            PipelineState::MaterializingOutputs => "dwl",
            PipelineState::ActionSucceeded => "suc",
            PipelineState::ActionFailed => "fail",
            PipelineState::ActionCancelled => "cncl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackResult {
    Success,
    Fail,
    Cancelled,
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub enum RemoteExecutionEvent {
    Scheduled {
        target: String,
    },
    Started {
        state: PipelineState,
        target: String,
        action_digest: Option<Digest>,
    },
    Finished {
        state: PipelineState,
        target: String,
        action_digest: Option<Digest>,
        duration_ms: u64,
    },
    Terminal {
        state: PipelineState,
        target: String,
        action_digest: Option<Digest>,
        metadata: Option<ExecutedActionMetadata>,
    },
    CasUpload {
        blobs: u64,
        bytes: u64,
    },
    CasDownload {
        blobs: u64,
        bytes: u64,
    },
    LocalFallback {
        target: String,
        remote: FallbackResult,
        local: FallbackResult,
    },
    /// A rule produced its outputs, whichever strategy built it
    RuleBuilt {
        target: String,
    },
}

impl RemoteExecutionEvent {
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Scheduled { target }
            | Self::Started { target, .. }
            | Self::Finished { target, .. }
            | Self::Terminal { target, .. }
            | Self::LocalFallback { target, .. }
            | Self::RuleBuilt { target } => Some(target),
            Self::CasUpload { .. } | Self::CasDownload { .. } => None,
        }
    }
}

pub trait RemoteExecutionListener: Send + Sync {
    fn on_event(&self, event: &RemoteExecutionEvent);
}

/// Synchronous fan-out to every subscribed listener.
///
/// Posting never fails: a panicking listener is logged and skipped.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Arc<dyn RemoteExecutionListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: Arc<dyn RemoteExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn post(&self, event: RemoteExecutionEvent) {
        tracing::trace!(?event, "remote execution event");
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                tracing::warn!("remote execution listener panicked; event dropped for it");
            }
        }
    }
}

pub struct BroadcastListener {
    tx: broadcast::Sender<RemoteExecutionEvent>,
}

impl BroadcastListener {
    pub fn new(tx: broadcast::Sender<RemoteExecutionEvent>) -> Self {
        Self { tx }
    }
}

impl RemoteExecutionListener for BroadcastListener {
    fn on_event(&self, event: &RemoteExecutionEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Per-action event emitter.
///
/// Tracks the action's current state, enforces forward-only transitions and guarantees
/// exactly one terminal event: duplicates are suppressed, and dropping the emitter without
/// one (the pipeline was aborted) posts `ActionCancelled`.
pub struct ActionEvents {
    bus: Arc<EventBus>,
    target: String,
    current: Mutex<PipelineState>,
    terminal_sent: AtomicBool,
    action_digest: Mutex<Option<Digest>>,
}

impl ActionEvents {
    /// Posts the `Scheduled` event.
    pub fn scheduled(bus: Arc<EventBus>, target: impl Into<String>) -> Self {
        let target = target.into();
        bus.post(RemoteExecutionEvent::Scheduled {
            target: target.clone(),
        });
        Self {
            bus,
            target,
            current: Mutex::new(PipelineState::Waiting),
            terminal_sent: AtomicBool::new(false),
            action_digest: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn current_state(&self) -> PipelineState {
        *self.current.lock()
    }

    fn advance(&self, next: PipelineState) -> bool {
        let mut current = self.current.lock();
        if !current.can_transition_to(next) {
            tracing::warn!(
                target_label = %self.target,
                from = ?*current,
                to = ?next,
                "ignoring out-of-order pipeline transition"
            );
            return false;
        }
        *current = next;
        true
    }

    /// Enters a non-terminal state; the returned scope posts `Finished` when dropped.
    pub fn scope(&self, state: PipelineState, action_digest: Option<&Digest>) -> StateScope<'_> {
        if let Some(digest) = action_digest {
            *self.action_digest.lock() = Some(digest.clone());
        }
        let active = self.advance(state);
        if active {
            self.bus.post(RemoteExecutionEvent::Started {
                state,
                target: self.target.clone(),
                action_digest: action_digest.cloned(),
            });
        }
        StateScope {
            events: self,
            state,
            action_digest: action_digest.cloned(),
            started: Instant::now(),
            active,
        }
    }

    /// Posts the terminal event unless one was already sent. Returns whether it was posted.
    pub fn terminal(
        &self,
        state: PipelineState,
        action_digest: Option<&Digest>,
        metadata: Option<ExecutedActionMetadata>,
    ) -> bool {
        debug_assert!(state.is_terminal());
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.current.lock() = state;
        let action_digest = action_digest
            .cloned()
            .or_else(|| self.action_digest.lock().clone());
        self.bus.post(RemoteExecutionEvent::Terminal {
            state,
            target: self.target.clone(),
            action_digest,
            metadata,
        });
        true
    }

    pub fn has_terminated(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }
}

impl Drop for ActionEvents {
    fn drop(&mut self) {
        if !self.has_terminated() {
            tracing::debug!(target_label = %self.target, "pipeline dropped before terminal event");
            self.terminal(PipelineState::ActionCancelled, None, None);
        }
    }
}

#[must_use]
pub struct StateScope<'a> {
    events: &'a ActionEvents,
    state: PipelineState,
    action_digest: Option<Digest>,
    started: Instant,
    active: bool,
}

impl Drop for StateScope<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.events.bus.post(RemoteExecutionEvent::Finished {
            state: self.state,
            target: self.events.target.clone(),
            action_digest: self.action_digest.take(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        });
    }
}
