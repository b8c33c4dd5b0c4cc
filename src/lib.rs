pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod limiter;
pub mod logging;
pub mod protocol;
pub mod remote_exec;
pub mod sandbox;
pub mod storage;
