// Centralized defaults for the remote execution pipeline

/// Worker threads of the runtime that drives action pipelines
pub const DEFAULT_REMOTE_EXECUTION_THREADS: usize = 12;

/// Actions whose input tree / command / action digests are computed concurrently
pub const DEFAULT_MAX_CONCURRENT_ACTION_COMPUTATIONS: usize = 4;

/// Actions uploading inputs to the CAS concurrently
pub const DEFAULT_MAX_CONCURRENT_PENDING_UPLOADS: usize = 100;

/// Actions dispatched to the execution service concurrently
pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 80;

/// Actions deleting stale outputs and materializing results concurrently
pub const DEFAULT_MAX_CONCURRENT_RESULT_HANDLING: usize = 6;

/// Prefix of environment variables overriding the config file
pub const CONFIG_ENV_PREFIX: &str = "REXEC_";

/// Default log filter when RUST_LOG is unset
pub const DEFAULT_LOG_FILTER: &str = "rexec=info";

/// Capacity of the CLI's event broadcast channel
pub const EVENT_BROADCAST_CAPACITY: usize = 1024;
