use crate::events::{
    FallbackResult, PipelineState, RemoteExecutionEvent, RemoteExecutionListener,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Counters fed by remote execution events.
///
/// A state change is applied as increment-new-state then decrement-old-state. Every
/// decrement pairs with an earlier increment of the same counter by the same action, so a
/// concurrent reader never sees a negative count (it may briefly see an action counted in
/// two states).
#[derive(Debug)]
pub struct RemoteExecutionStats {
    action_state_count: [AtomicI64; PipelineState::ALL.len()],
    downloads: AtomicU64,
    download_bytes: AtomicU64,
    uploads: AtomicU64,
    upload_bytes: AtomicU64,
    remote_cpu_time_ms: AtomicU64,
    total_rules_built: AtomicU64,
    has_first_remote_action_started: AtomicBool,
    local_fallback_total_executions: AtomicU64,
    local_fallback_local_executions: AtomicU64,
    local_fallback_successful_local_executions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalFallbackStats {
    pub total_executed_rules: u64,
    pub locally_executed_rules: u64,
    pub locally_successful_rules: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub actions_per_state: BTreeMap<PipelineState, i64>,
    pub cas_uploads: u64,
    pub cas_upload_bytes: u64,
    pub cas_downloads: u64,
    pub cas_download_bytes: u64,
    pub remote_cpu_time_ms: u64,
    pub total_rules_built: u64,
    pub local_fallback: LocalFallbackStats,
}

impl StatsSnapshot {
    pub fn state_count(&self, state: PipelineState) -> i64 {
        self.actions_per_state.get(&state).copied().unwrap_or(0)
    }

    pub fn remote_cpu_time(&self) -> Duration {
        Duration::from_millis(self.remote_cpu_time_ms)
    }
}

impl Default for RemoteExecutionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteExecutionStats {
    pub fn new() -> Self {
        Self {
            action_state_count: std::array::from_fn(|_| AtomicI64::new(0)),
            downloads: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
            upload_bytes: AtomicU64::new(0),
            remote_cpu_time_ms: AtomicU64::new(0),
            total_rules_built: AtomicU64::new(0),
            has_first_remote_action_started: AtomicBool::new(false),
            local_fallback_total_executions: AtomicU64::new(0),
            local_fallback_local_executions: AtomicU64::new(0),
            local_fallback_successful_local_executions: AtomicU64::new(0),
        }
    }

    fn counter(&self, state: PipelineState) -> &AtomicI64 {
        &self.action_state_count[state.index()]
    }

    fn transition(&self, from: PipelineState, to: PipelineState) {
        self.counter(to).fetch_add(1, Ordering::SeqCst);
        self.counter(from).fetch_sub(1, Ordering::SeqCst);
    }

    pub fn state_count(&self, state: PipelineState) -> i64 {
        self.counter(state).load(Ordering::SeqCst)
    }

    pub fn actions_per_state(&self) -> BTreeMap<PipelineState, i64> {
        PipelineState::ALL
            .iter()
            .map(|&state| (state, self.state_count(state)))
            .collect()
    }

    pub fn cas_uploads(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn cas_upload_bytes(&self) -> u64 {
        self.upload_bytes.load(Ordering::SeqCst)
    }

    pub fn cas_downloads(&self) -> u64 {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn cas_download_bytes(&self) -> u64 {
        self.download_bytes.load(Ordering::SeqCst)
    }

    pub fn remote_cpu_time(&self) -> Duration {
        Duration::from_millis(self.remote_cpu_time_ms.load(Ordering::SeqCst))
    }

    pub fn total_rules_built(&self) -> u64 {
        self.total_rules_built.load(Ordering::SeqCst)
    }

    pub fn has_first_remote_action_started(&self) -> bool {
        self.has_first_remote_action_started.load(Ordering::SeqCst)
    }

    pub fn local_fallback_stats(&self) -> LocalFallbackStats {
        LocalFallbackStats {
            total_executed_rules: self.local_fallback_total_executions.load(Ordering::SeqCst),
            locally_executed_rules: self.local_fallback_local_executions.load(Ordering::SeqCst),
            locally_successful_rules: self
                .local_fallback_successful_local_executions
                .load(Ordering::SeqCst),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            actions_per_state: self.actions_per_state(),
            cas_uploads: self.cas_uploads(),
            cas_upload_bytes: self.cas_upload_bytes(),
            cas_downloads: self.cas_downloads(),
            cas_download_bytes: self.cas_download_bytes(),
            remote_cpu_time_ms: self.remote_cpu_time_ms.load(Ordering::SeqCst),
            total_rules_built: self.total_rules_built(),
            local_fallback: self.local_fallback_stats(),
        }
    }
}

impl RemoteExecutionListener for RemoteExecutionStats {
    fn on_event(&self, event: &RemoteExecutionEvent) {
        match event {
            RemoteExecutionEvent::Scheduled { .. } => {
                self.has_first_remote_action_started
                    .store(true, Ordering::SeqCst);
                self.counter(PipelineState::Waiting)
                    .fetch_add(1, Ordering::SeqCst);
            }
            RemoteExecutionEvent::Started { state, .. } => {
                self.transition(PipelineState::Waiting, *state);
            }
            RemoteExecutionEvent::Finished { state, .. } => {
                self.transition(*state, PipelineState::Waiting);
            }
            RemoteExecutionEvent::Terminal {
                state, metadata, ..
            } => {
                self.transition(PipelineState::Waiting, *state);
                if let Some(cpu) = metadata.as_ref().and_then(|m| m.execution_duration()) {
                    self.remote_cpu_time_ms
                        .fetch_add(cpu.as_millis() as u64, Ordering::SeqCst);
                }
            }
            RemoteExecutionEvent::CasUpload { blobs, bytes } => {
                self.uploads.fetch_add(*blobs, Ordering::SeqCst);
                self.upload_bytes.fetch_add(*bytes, Ordering::SeqCst);
            }
            RemoteExecutionEvent::CasDownload { blobs, bytes } => {
                self.downloads.fetch_add(*blobs, Ordering::SeqCst);
                self.download_bytes.fetch_add(*bytes, Ordering::SeqCst);
            }
            RemoteExecutionEvent::RuleBuilt { .. } => {
                self.total_rules_built.fetch_add(1, Ordering::SeqCst);
            }
            RemoteExecutionEvent::LocalFallback { local, .. } => {
                self.local_fallback_total_executions
                    .fetch_add(1, Ordering::SeqCst);
                if *local != FallbackResult::NotRun {
                    self.local_fallback_local_executions
                        .fetch_add(1, Ordering::SeqCst);
                }
                if *local == FallbackResult::Success {
                    self.local_fallback_successful_local_executions
                        .fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}
