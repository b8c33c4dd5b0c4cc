//! Structured logging for the remote execution pipeline.
//!
//! Pipeline stages log through the macros below so field names stay uniform across the
//! CAS, the orchestrator and the workers.
use crate::constants::DEFAULT_LOG_FILTER;
use std::io;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Installs the global subscriber. `RUST_LOG` overrides the default `rexec=info` filter.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(json_output: bool) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Action spans close when their pipeline ends, which is when the duration is useful.
    let output = if json_output {
        fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    Registry::default().with(env_filter).with(output).try_init()?;
    Ok(())
}

#[macro_export]
macro_rules! log_cas_verify_fail {
    ($expected:expr, $actual:expr, $size:expr) => {
        tracing::error!(
            expected = %$expected.get(..8).unwrap_or($expected.as_str()),
            actual = %$actual.get(..8).unwrap_or($actual.as_str()),
            size = $size,
            "CAS verification failed"
        );
    };
}

#[macro_export]
macro_rules! log_remote_operation {
    ($operation:expr, $status:expr, $duration_ms:expr) => {
        tracing::debug!(
            operation = $operation,
            status = $status,
            duration_ms = $duration_ms,
            "Remote operation completed"
        );
    };
}

#[macro_export]
macro_rules! log_upload {
    ($action:expr, $blobs:expr, $bytes:expr) => {
        tracing::debug!(
            action = %$action.short_hash(),
            blobs = $blobs,
            bytes = $bytes,
            "Uploaded action inputs"
        );
    };
}

#[macro_export]
macro_rules! log_action_terminal {
    ($rule:expr, $state:expr) => {
        tracing::info!(rule = %$rule, state = ?$state, "Remote action finished");
    };
}
