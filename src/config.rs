//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default cap on a single message frame (16 MiB).
const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Tasker manager configuration.
#[derive(Debug, Clone)]
pub struct TaskerConfig {
    /// Maximum number of live execution contexts.
    pub max_concurrent_contexts: usize,
    /// Deadline applied to tasks that carry none of their own (None = no deadline).
    pub default_timeout: Option<Duration>,
    /// Reuse idle contexts, or tear each one down after a single task.
    pub context_reuse: bool,
    /// How long shutdown waits for in-flight tasks before terminating them.
    pub shutdown_grace_period: Duration,
    /// Largest request or response frame allowed across the boundary.
    pub max_message_bytes: usize,
    /// Base directory for normalizing local module references.
    pub base_dir: PathBuf,
    /// Name prefix for context threads.
    pub thread_name_prefix: String,
}

impl Default for TaskerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_contexts: default_max_contexts(),
            default_timeout: None,
            context_reuse: true,
            shutdown_grace_period: Duration::from_secs(5),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            thread_name_prefix: "tasker-ctx".to_string(),
        }
    }
}

fn default_max_contexts() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl TaskerConfig {
    /// Build a config from defaults overlaid with environment variables.
    ///
    /// Environment variables:
    /// - TASKER_MAX_CONTEXTS: Maximum live contexts (default: available parallelism)
    /// - TASKER_DEFAULT_TIMEOUT_MS: Default task deadline in ms (0 or unset = none)
    /// - TASKER_CONTEXT_REUSE: Reuse idle contexts (default: true)
    /// - TASKER_SHUTDOWN_GRACE_MS: Shutdown grace period in ms (default: 5000)
    /// - TASKER_MAX_MESSAGE_BYTES: Frame size limit (default: 16 MiB)
    /// - TASKER_BASE_DIR: Base directory for local module references
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("TASKER_MAX_CONTEXTS")? {
            config.max_concurrent_contexts = n;
        }
        if let Some(ms) = env_parse::<u64>("TASKER_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Ok(v) = std::env::var("TASKER_CONTEXT_REUSE") {
            config.context_reuse = parse_bool("TASKER_CONTEXT_REUSE", &v)?;
        }
        if let Some(ms) = env_parse::<u64>("TASKER_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace_period = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("TASKER_MAX_MESSAGE_BYTES")? {
            config.max_message_bytes = n;
        }
        if let Ok(dir) = std::env::var("TASKER_BASE_DIR") {
            config.base_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the configured bounds are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_contexts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_contexts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_message_bytes".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.default_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "default_timeout".to_string(),
                message: "use None instead of a zero timeout".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_max_contexts(mut self, n: usize) -> Self {
        self.max_concurrent_contexts = n;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_context_reuse(mut self, reuse: bool) -> Self {
        self.context_reuse = reuse;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("{key}: {e}"))),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}
