//! Remote execution settings: defaults, JSON config file, `REXEC_*` environment overrides.

use crate::constants::*;
use crate::error::ConfigError;
use crate::protocol::HashFunction;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteExecutionConfig {
    pub threads: usize,
    /// `0` disables the limit for this stage
    pub max_concurrent_action_computations: usize,
    pub max_concurrent_pending_uploads: usize,
    pub max_concurrent_executions: usize,
    pub max_concurrent_result_handling: usize,
    /// Actions whose required blobs add up to more than this are not sent remotely
    pub max_input_size_bytes: Option<u64>,
    pub local_fallback_enabled: bool,
    /// Run an action locally when it was cancelled before being dispatched
    pub fallback_on_cancellation: bool,
    pub hash_function: HashFunction,
}

impl Default for RemoteExecutionConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_REMOTE_EXECUTION_THREADS,
            max_concurrent_action_computations: DEFAULT_MAX_CONCURRENT_ACTION_COMPUTATIONS,
            max_concurrent_pending_uploads: DEFAULT_MAX_CONCURRENT_PENDING_UPLOADS,
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT_EXECUTIONS,
            max_concurrent_result_handling: DEFAULT_MAX_CONCURRENT_RESULT_HANDLING,
            max_input_size_bytes: None,
            local_fallback_enabled: false,
            fallback_on_cancellation: false,
            hash_function: HashFunction::default(),
        }
    }
}

impl RemoteExecutionConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Config file (if any), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `REXEC_*` overrides looked up through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let name = format!("{}{}", CONFIG_ENV_PREFIX, suffix);
            lookup(&name).map(|value| (name, value))
        };

        if let Some((name, value)) = var("THREADS") {
            self.threads = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = var("MAX_CONCURRENT_ACTION_COMPUTATIONS") {
            self.max_concurrent_action_computations = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = var("MAX_CONCURRENT_PENDING_UPLOADS") {
            self.max_concurrent_pending_uploads = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = var("MAX_CONCURRENT_EXECUTIONS") {
            self.max_concurrent_executions = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = var("MAX_CONCURRENT_RESULT_HANDLING") {
            self.max_concurrent_result_handling = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = var("MAX_INPUT_SIZE_BYTES") {
            self.max_input_size_bytes = if value.is_empty() {
                None
            } else {
                Some(parse_env(&name, &value)?)
            };
        }
        if let Some((name, value)) = var("LOCAL_FALLBACK") {
            self.local_fallback_enabled = parse_bool(&name, &value)?;
        }
        if let Some((name, value)) = var("FALLBACK_ON_CANCELLATION") {
            self.fallback_on_cancellation = parse_bool(&name, &value)?;
        }
        if let Some((name, value)) = var("HASH_FUNCTION") {
            self.hash_function = parse_env(&name, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::Invalid("threads must be at least 1".to_string()));
        }
        if self.max_input_size_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "max_input_size_bytes must be positive; omit it to disable the limit".to_string(),
            ));
        }
        if self.fallback_on_cancellation && !self.local_fallback_enabled {
            tracing::warn!("fallback_on_cancellation has no effect while local fallback is disabled");
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RemoteExecutionConfig::default();
        assert_eq!(config.threads, 12);
        assert_eq!(config.max_concurrent_action_computations, 4);
        assert_eq!(config.max_concurrent_pending_uploads, 100);
        assert_eq!(config.max_concurrent_executions, 80);
        assert_eq!(config.max_concurrent_result_handling, 6);
        assert_eq!(config.max_input_size_bytes, None);
        assert!(!config.local_fallback_enabled);
        assert!(!config.fallback_on_cancellation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_concurrent_executions": 3, "local_fallback_enabled": true, "hash_function": "blake3"}}"#
        )
        .unwrap();

        let config = RemoteExecutionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrent_executions, 3);
        assert!(config.local_fallback_enabled);
        assert_eq!(config.hash_function, HashFunction::Blake3);
        assert_eq!(config.threads, 12);
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            RemoteExecutionConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RemoteExecutionConfig::default();
        config
            .apply_env_overrides(lookup(&[
                ("REXEC_THREADS", "2"),
                ("REXEC_MAX_INPUT_SIZE_BYTES", "1048576"),
                ("REXEC_LOCAL_FALLBACK", "yes"),
                ("REXEC_HASH_FUNCTION", "BLAKE3"),
            ]))
            .unwrap();
        assert_eq!(config.threads, 2);
        assert_eq!(config.max_input_size_bytes, Some(1_048_576));
        assert!(config.local_fallback_enabled);
        assert_eq!(config.hash_function, HashFunction::Blake3);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = RemoteExecutionConfig::default();
        let err = config
            .apply_env_overrides(lookup(&[("REXEC_MAX_CONCURRENT_EXECUTIONS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("REXEC_MAX_CONCURRENT_EXECUTIONS"));
    }

    #[test]
    fn test_validation() {
        let config = RemoteExecutionConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RemoteExecutionConfig {
            max_input_size_bytes: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
