//! Status lines for the build console.

use crate::events::{PipelineState, StatsSnapshot};

/// Column order of the `Remote=[...]` block
const CONSOLE_STATE_ORDER: [PipelineState; 9] = [
    PipelineState::Waiting,
    PipelineState::DeletingStaleOutputs,
    PipelineState::ComputingAction,
    PipelineState::UploadingInputs,
    PipelineState::Executing,
    PipelineState::MaterializingOutputs,
    PipelineState::ActionSucceeded,
    PipelineState::ActionFailed,
    PipelineState::ActionCancelled,
];

const SIZE_UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];

/// Renders the remote execution summary.
///
/// In debug mode this is the detailed `[RE]` block; otherwise a single line with the remote
/// CPU time.
pub fn console_lines(snapshot: &StatsSnapshot, session_info: Option<&str>, debug: bool) -> Vec<String> {
    if !debug {
        return vec![format!(
            "Building with Remote Execution: {} minutes spent building remotely",
            format_minutes(snapshot.remote_cpu_time().as_secs())
        )];
    }

    let mut lines = Vec::new();
    if let Some(info) = session_info {
        lines.push(format!("[RE] Metadata: Session ID=[{}]", info));
    }

    let remote = CONSOLE_STATE_ORDER
        .iter()
        .map(|state| format!("{}={}", state.short_name(), snapshot.state_count(*state)))
        .collect::<Vec<_>>()
        .join(" ");
    let succeeded_remotely = snapshot.state_count(PipelineState::ActionSucceeded).max(0) as u64;
    let local = snapshot.total_rules_built.saturating_sub(succeeded_remotely);
    lines.push(format!("[RE] Actions: Local={} Remote=[{}]", local, remote));

    lines.push(format!(
        "[RE] CAS: Upl=[Count:{} Size={}] Dwl=[Count:{} Size={}]",
        snapshot.cas_uploads,
        human_readable_size(snapshot.cas_upload_bytes),
        snapshot.cas_downloads,
        human_readable_size(snapshot.cas_download_bytes)
    ));

    let fallback = snapshot.local_fallback;
    if fallback.locally_executed_rules > 0 {
        let rate = if fallback.total_executed_rules == 0 {
            0.0
        } else {
            fallback.locally_executed_rules as f64 * 100.0 / fallback.total_executed_rules as f64
        };
        lines.push(format!(
            "[RE] LocalFallback: [fallback_rate={:.2}% remote={} local={}]",
            rate,
            fallback
                .total_executed_rules
                .saturating_sub(fallback.locally_executed_rules),
            fallback.locally_successful_rules
        ));
    }

    lines
}

pub fn human_readable_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, SIZE_UNITS[unit])
}

fn format_minutes(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}
